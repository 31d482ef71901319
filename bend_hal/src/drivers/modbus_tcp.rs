//! Modbus-TCP transport.
//!
//! One `tokio_modbus` client context per transport, guarded by an async
//! mutex so at most one request is on the wire. Each request is bounded by
//! `fieldbus.timeout_ms` and retried up to `fieldbus.retries` times with
//! `fieldbus.retry_backoff_ms` between attempts. Exception responses are
//! answers, not failures, and are never retried.
//!
//! When the retries of a request are exhausted the context is dropped, the
//! transport reports `Disconnected` and every later call fails with
//! `NotConnected` until `connect()` succeeds again.

use async_trait::async_trait;
use bend_common::config::FieldbusConfig;
use bend_common::consts::EVENT_CHANNEL_CAPACITY;
use bend_common::fieldbus::{FieldbusError, FieldbusEvent, FieldbusTransport};
use bend_common::status::ConnectionState;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, broadcast};
use tokio::time::{sleep, timeout};
use tokio_modbus::client::{Client, Context, Reader, Writer, tcp};
use tokio_modbus::{ExceptionCode, Slave};
use tracing::{debug, info, warn};

/// One on-the-wire request.
#[derive(Debug, Clone)]
enum Op {
    ReadCoils(u16, u16),
    WriteCoil(u16, bool),
    WriteCoils(u16, Vec<bool>),
    ReadHolding(u16, u16),
    WriteHolding(u16, u16),
    WriteHoldings(u16, Vec<u16>),
    ReadInputs(u16, u16),
}

impl Op {
    fn address(&self) -> u16 {
        match self {
            Op::ReadCoils(a, _)
            | Op::WriteCoil(a, _)
            | Op::WriteCoils(a, _)
            | Op::ReadHolding(a, _)
            | Op::WriteHolding(a, _)
            | Op::WriteHoldings(a, _)
            | Op::ReadInputs(a, _) => *a,
        }
    }
}

/// Decoded answer to an `Op`.
#[derive(Debug)]
enum Reply {
    Bits(Vec<bool>),
    Words(Vec<u16>),
    Done,
}

type WireResult = Result<Result<Reply, ExceptionCode>, tokio_modbus::Error>;

async fn perform(ctx: &mut Context, op: &Op) -> WireResult {
    Ok(match op {
        Op::ReadCoils(a, n) => ctx.read_coils(*a, *n).await?.map(Reply::Bits),
        Op::WriteCoil(a, v) => ctx.write_single_coil(*a, *v).await?.map(|()| Reply::Done),
        Op::WriteCoils(a, v) => ctx.write_multiple_coils(*a, v).await?.map(|()| Reply::Done),
        Op::ReadHolding(a, n) => ctx.read_holding_registers(*a, *n).await?.map(Reply::Words),
        Op::WriteHolding(a, v) => ctx.write_single_register(*a, *v).await?.map(|()| Reply::Done),
        Op::WriteHoldings(a, v) => ctx
            .write_multiple_registers(*a, v)
            .await?
            .map(|()| Reply::Done),
        Op::ReadInputs(a, n) => ctx.read_input_registers(*a, *n).await?.map(Reply::Words),
    })
}

/// Fieldbus transport to one Modbus-TCP slave.
pub struct ModbusTcpTransport {
    config: FieldbusConfig,
    ctx: Mutex<Option<Context>>,
    connected: AtomicBool,
    events: broadcast::Sender<FieldbusEvent>,
}

impl ModbusTcpTransport {
    pub fn new(config: FieldbusConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            ctx: Mutex::new(None),
            connected: AtomicBool::new(false),
            events,
        }
    }

    pub fn config(&self) -> &FieldbusConfig {
        &self.config
    }

    fn emit(&self, event: FieldbusEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState, reason: impl Into<String>) {
        self.emit(FieldbusEvent::ConnectionChanged {
            state,
            reason: reason.into(),
        });
    }

    async fn resolve(&self) -> Result<SocketAddr, FieldbusError> {
        let target = (self.config.host.as_str(), self.config.port);
        tokio::net::lookup_host(target)
            .await
            .map_err(|e| FieldbusError::Connect(format!("{}: {e}", self.config.host)))?
            .next()
            .ok_or_else(|| FieldbusError::Connect(format!("{}: no address", self.config.host)))
    }

    /// Run `op` with the per-request retry policy.
    async fn execute(&self, op: Op) -> Result<Reply, FieldbusError> {
        let mut guard = self.ctx.lock().await;
        let address = op.address();
        let mut attempt = 0u32;

        loop {
            let Some(ctx) = guard.as_mut() else {
                return Err(FieldbusError::NotConnected);
            };

            let (err, cause) = match timeout(self.config.timeout(), perform(ctx, &op)).await {
                Ok(Ok(Ok(reply))) => return Ok(reply),
                Ok(Ok(Err(code))) => {
                    let err = FieldbusError::Exception {
                        address,
                        code: code.to_string(),
                    };
                    warn!(address, %code, "Modbus exception response");
                    self.emit(FieldbusEvent::Error {
                        message: err.to_string(),
                        address: Some(address),
                        cause: None,
                    });
                    return Err(err);
                }
                Ok(Err(e)) => (
                    FieldbusError::Transport {
                        address,
                        message: e.to_string(),
                    },
                    Some(e.to_string()),
                ),
                Err(_) => (FieldbusError::Timeout { address }, None),
            };

            if attempt >= self.config.retries {
                warn!(address, attempts = attempt + 1, error = %err, "Request failed, dropping connection");
                *guard = None;
                self.connected.store(false, Ordering::SeqCst);
                self.emit(FieldbusEvent::Error {
                    message: err.to_string(),
                    address: Some(address),
                    cause,
                });
                self.set_state(ConnectionState::Disconnected, err.to_string());
                return Err(err);
            }

            attempt += 1;
            debug!(address, attempt, error = %err, "Retrying request");
            sleep(self.config.retry_backoff()).await;
        }
    }

    fn bits(address: u16, reply: Reply) -> Result<Vec<bool>, FieldbusError> {
        match reply {
            Reply::Bits(bits) => Ok(bits),
            other => Err(FieldbusError::InvalidResponse {
                address,
                message: format!("expected coils, got {other:?}"),
            }),
        }
    }

    fn words(address: u16, reply: Reply) -> Result<Vec<u16>, FieldbusError> {
        match reply {
            Reply::Words(words) => Ok(words),
            other => Err(FieldbusError::InvalidResponse {
                address,
                message: format!("expected registers, got {other:?}"),
            }),
        }
    }
}

#[async_trait]
impl FieldbusTransport for ModbusTcpTransport {
    fn name(&self) -> &'static str {
        "modbus_tcp"
    }

    async fn connect(&self) -> Result<(), FieldbusError> {
        let mut guard = self.ctx.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting, "connect requested");
        let attempt = async {
            let addr = self.resolve().await?;
            let slave = Slave(self.config.slave_id);
            match timeout(self.config.timeout(), tcp::connect_slave(addr, slave)).await {
                Ok(Ok(ctx)) => Ok((addr, ctx)),
                Ok(Err(e)) => Err(FieldbusError::Connect(format!("{addr}: {e}"))),
                Err(_) => Err(FieldbusError::Connect(format!("{addr}: timed out"))),
            }
        };

        match attempt.await {
            Ok((addr, ctx)) => {
                *guard = Some(ctx);
                self.connected.store(true, Ordering::SeqCst);
                info!(%addr, slave_id = self.config.slave_id, "Modbus-TCP connected");
                self.set_state(ConnectionState::Connected, format!("connected to {addr}"));
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Modbus-TCP connect failed");
                self.emit(FieldbusEvent::Error {
                    message: err.to_string(),
                    address: None,
                    cause: None,
                });
                self.set_state(ConnectionState::Disconnected, err.to_string());
                Err(err)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), FieldbusError> {
        let mut guard = self.ctx.lock().await;
        let Some(mut ctx) = guard.take() else {
            return Ok(());
        };
        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = ctx.disconnect().await {
            debug!(error = %e, "Modbus-TCP close reported an error");
        }
        info!("Modbus-TCP disconnected");
        self.set_state(ConnectionState::Disconnected, "disconnect requested");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<FieldbusEvent> {
        self.events.subscribe()
    }

    async fn read_coils(&self, address: u16, count: u16) -> Result<Vec<bool>, FieldbusError> {
        let reply = self.execute(Op::ReadCoils(address, count)).await?;
        Self::bits(address, reply)
    }

    async fn write_coil(&self, address: u16, value: bool) -> Result<(), FieldbusError> {
        self.execute(Op::WriteCoil(address, value)).await.map(drop)
    }

    async fn write_coils(&self, address: u16, values: &[bool]) -> Result<(), FieldbusError> {
        self.execute(Op::WriteCoils(address, values.to_vec()))
            .await
            .map(drop)
    }

    async fn read_holding_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, FieldbusError> {
        let reply = self.execute(Op::ReadHolding(address, count)).await?;
        Self::words(address, reply)
    }

    async fn write_holding_register(&self, address: u16, value: u16) -> Result<(), FieldbusError> {
        self.execute(Op::WriteHolding(address, value)).await.map(drop)
    }

    async fn write_holding_registers(
        &self,
        address: u16,
        values: &[u16],
    ) -> Result<(), FieldbusError> {
        self.execute(Op::WriteHoldings(address, values.to_vec()))
            .await
            .map(drop)
    }

    async fn read_input_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, FieldbusError> {
        let reply = self.execute(Op::ReadInputs(address, count)).await?;
        Self::words(address, reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FieldbusConfig {
        FieldbusConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            timeout_ms: 200,
            ..FieldbusConfig::default()
        }
    }

    #[tokio::test]
    async fn calls_before_connect_fail() {
        let transport = ModbusTcpTransport::new(config());
        assert!(!transport.is_connected());
        assert_eq!(
            transport.read_input_register(0).await,
            Err(FieldbusError::NotConnected)
        );
        assert_eq!(
            transport.write_coil(0, true).await,
            Err(FieldbusError::NotConnected)
        );
    }

    #[tokio::test]
    async fn disconnect_without_connection_is_noop() {
        let transport = ModbusTcpTransport::new(config());
        assert!(transport.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn refused_connect_reports_disconnected() {
        let transport = ModbusTcpTransport::new(config());
        let mut events = transport.subscribe();

        assert!(matches!(
            transport.connect().await,
            Err(FieldbusError::Connect(_))
        ));
        assert!(!transport.is_connected());

        assert!(matches!(
            events.recv().await.unwrap(),
            FieldbusEvent::ConnectionChanged { state: ConnectionState::Connecting, .. }
        ));
        assert!(matches!(events.recv().await.unwrap(), FieldbusEvent::Error { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            FieldbusEvent::ConnectionChanged { state: ConnectionState::Disconnected, .. }
        ));
    }

    #[test]
    fn op_addresses() {
        assert_eq!(Op::WriteHoldings(12, vec![1, 2]).address(), 12);
        assert_eq!(Op::ReadCoils(3, 8).address(), 3);
    }
}
