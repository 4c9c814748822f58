//! # Session Engine
//!
//! A [`Session`] is a cheap handle onto a driver task that owns the
//! transport and all protocol state. The handle serializes requests
//! through a mailbox, so clones can be shared freely; the driver keeps
//! at most one request in flight and answers each through its own
//! oneshot channel.
//!
//! On start the session probes the peer with `ATZ`: an ASCII banner
//! marks an ELM327 text-mode adapter, silence a raw binary ISO-TP
//! bridge. Both dialects present the same request/response surface.

pub mod elm327;

mod driver;

use std::time::Duration;

use log::{debug, info};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::constants::DEFAULT_REQUEST_TIMEOUT;
use crate::error::{ObdError, TransportError};
use crate::isotp::AddressMode;
use crate::obd::codec::{DecodedValue, ObdRequest};
use crate::transport::Transport;

use driver::{Driver, LinkMode};

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// BS advertised in our flow control frames (0 = no limit).
    pub block_size: u8,
    /// STmin advertised in our flow control frames (raw byte).
    pub st_min: u8,
    /// ISO-TP addressing for the raw binary dialect.
    pub address_mode: AddressMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            block_size: 0,
            st_min: 0,
            address_mode: AddressMode::Normal,
        }
    }
}

pub(crate) enum Command {
    Request {
        req: ObdRequest,
        timeout: Duration,
        reply: oneshot::Sender<Result<DecodedValue, ObdError>>,
    },
    Raw {
        payload: Vec<u8>,
        timeout: Duration,
        reply: oneshot::Sender<Result<Vec<u8>, ObdError>>,
    },
    Cancel,
    Shutdown,
}

/// Handle onto one diagnostic session. Clone freely; all clones feed the
/// same driver task.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::Sender<Command>,
    request_timeout: Duration,
}

impl Session {
    /// Starts a session, probing the peer's dialect first: `ATZ` is sent
    /// and an ASCII banner within one timeout window selects ELM327 text
    /// mode, anything else the raw binary framing.
    pub async fn connect(
        mut transport: Box<dyn Transport>,
        config: SessionConfig,
    ) -> Result<Session, ObdError> {
        let is_elm = elm327::probe(transport.as_mut(), config.request_timeout).await?;
        if is_elm {
            info!("peer identified as ELM327, running init sequence");
            elm327::initialize(transport.as_mut()).await?;
            Ok(Self::spawn(transport, config, true))
        } else {
            info!("peer is a raw binary adapter");
            Ok(Self::spawn(transport, config, false))
        }
    }

    /// Starts a session in raw binary mode without probing.
    pub fn start_raw(transport: Box<dyn Transport>, config: SessionConfig) -> Session {
        Self::spawn(transport, config, false)
    }

    /// Starts a session in ELM327 text mode, assuming the adapter is
    /// already initialized (echo off, headers on).
    pub fn start_elm(transport: Box<dyn Transport>, config: SessionConfig) -> Session {
        Self::spawn(transport, config, true)
    }

    fn spawn(transport: Box<dyn Transport>, config: SessionConfig, elm: bool) -> Session {
        let mode = if elm {
            LinkMode::elm()
        } else {
            LinkMode::raw(&config)
        };
        let (tx, rx) = mpsc::channel(16);
        let request_timeout = config.request_timeout;
        let driver = Driver::new(transport, config, mode, rx);
        tokio::spawn(driver.run());
        Session {
            commands: tx,
            request_timeout,
        }
    }

    /// Sends one request and decodes the response.
    pub async fn request(&self, req: ObdRequest) -> Result<DecodedValue, ObdError> {
        self.request_with_timeout(req, self.request_timeout).await
    }

    pub async fn request_with_timeout(
        &self,
        req: ObdRequest,
        timeout: Duration,
    ) -> Result<DecodedValue, ObdError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                req,
                timeout,
                reply,
            })
            .await
            .map_err(|_| ObdError::Transport(TransportError::Closed))?;
        rx.await.unwrap_or(Err(ObdError::Cancelled))
    }

    /// Sends raw service bytes and returns the first whole response
    /// message without decoding.
    pub async fn raw_request(&self, payload: Vec<u8>) -> Result<Vec<u8>, ObdError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Raw {
                payload,
                timeout: self.request_timeout,
                reply,
            })
            .await
            .map_err(|_| ObdError::Transport(TransportError::Closed))?;
        rx.await.unwrap_or(Err(ObdError::Cancelled))
    }

    /// Reads one Mode 0x01 PID.
    pub async fn read_pid(&self, pid: u8) -> Result<DecodedValue, ObdError> {
        self.request(ObdRequest::current_data(pid)).await
    }

    /// Reads the vehicle identification number.
    pub async fn read_vin(&self) -> Result<String, ObdError> {
        match self.request(ObdRequest::vin()).await? {
            DecodedValue::Text(vin) => Ok(vin),
            other => Err(ObdError::InvalidInput(format!(
                "unexpected VIN payload: {other:?}"
            ))),
        }
    }

    /// Reads stored trouble codes.
    pub async fn read_dtcs(&self) -> Result<Vec<String>, ObdError> {
        match self.request(ObdRequest::stored_dtcs()).await? {
            DecodedValue::Dtcs(codes) => Ok(codes),
            other => Err(ObdError::InvalidInput(format!(
                "unexpected DTC payload: {other:?}"
            ))),
        }
    }

    /// Clears trouble codes and stored freeze frames.
    pub async fn clear_dtcs(&self) -> Result<(), ObdError> {
        self.request(ObdRequest::clear_dtcs()).await.map(|_| ())
    }

    /// Polls a Mode 0x01 PID on a fixed period. The stream ends when the
    /// receiver is dropped or the link fails fatally.
    pub fn subscribe(
        &self,
        pid: u8,
        period: Duration,
    ) -> mpsc::Receiver<Result<DecodedValue, ObdError>> {
        let (tx, rx) = mpsc::channel(8);
        let session = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let result = session.read_pid(pid).await;
                let fatal = matches!(&result, Err(e) if e.is_fatal());
                if tx.send(result).await.is_err() {
                    debug!("pid 0x{pid:02X} subscriber dropped, stopping poll");
                    break;
                }
                if fatal {
                    break;
                }
            }
        });
        rx
    }

    /// Aborts the request currently in flight, if any.
    pub async fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel).await;
    }

    /// Stops the driver task and closes the transport.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}
