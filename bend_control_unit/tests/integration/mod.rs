mod machine;
mod positioning;
mod sync_loop;
