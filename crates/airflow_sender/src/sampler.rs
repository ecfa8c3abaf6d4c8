//! One sampling cycle: acquire session → exchange → parse → stamp.

use airflow_core::{parse, DeviceEndpoint, NumberPolicy, ParseError, Sample, SessionMode};
use serialport::SerialPort;
use tracing::debug;

use crate::session::{ConnectError, DeviceSession, ExchangeError, SerialLink};

/// Why a cycle produced no sample.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl SampleError {
    /// Short label of the underlying failure, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SampleError::Connect(_) => "connect",
            SampleError::Exchange(ExchangeError::WriteFailed(_)) => "write-failed",
            SampleError::Exchange(ExchangeError::ReadFailed(_)) => "read-failed",
            SampleError::Exchange(ExchangeError::Timeout(_)) => "timeout",
            SampleError::Parse(ParseError::ShortReply { .. }) => "short-reply",
            SampleError::Parse(ParseError::BadNumber { .. }) => "bad-number",
        }
    }
}

/// Anything the publish loop can pull samples from.
pub trait SampleSource {
    fn sample(&mut self) -> Result<Sample, SampleError>;
}

/// Acquires device sessions for the sampler.
pub trait Connector {
    type Port: SerialLink;

    fn connect(
        &mut self,
        endpoint: &DeviceEndpoint,
    ) -> Result<DeviceSession<Self::Port>, ConnectError>;
}

/// Opens the real serial device.
pub struct SerialConnector;

impl Connector for SerialConnector {
    type Port = Box<dyn SerialPort>;

    fn connect(
        &mut self,
        endpoint: &DeviceEndpoint,
    ) -> Result<DeviceSession<Self::Port>, ConnectError> {
        DeviceSession::open(endpoint)
    }
}

/// Samples one controller.
///
/// In [`SessionMode::Reopen`] the port is opened and closed around every
/// exchange. In [`SessionMode::KeepOpen`] it is held between cycles and
/// dropped after a failed exchange or an unparsable reply so the next cycle
/// starts clean.
pub struct DeviceSampler<C: Connector> {
    connector: C,
    endpoint: DeviceEndpoint,
    site: String,
    policy: NumberPolicy,
    mode: SessionMode,
    session: Option<DeviceSession<C::Port>>,
}

impl<C: Connector> DeviceSampler<C> {
    pub fn new(
        connector: C,
        endpoint: DeviceEndpoint,
        site: impl Into<String>,
        policy: NumberPolicy,
        mode: SessionMode,
    ) -> Self {
        Self {
            connector,
            endpoint,
            site: site.into(),
            policy,
            mode,
            session: None,
        }
    }

    /// Hands over a session opened at startup. Ignored in reopen mode.
    pub fn with_session(mut self, session: DeviceSession<C::Port>) -> Self {
        match self.mode {
            SessionMode::KeepOpen => self.session = Some(session),
            SessionMode::Reopen => session.close(),
        }
        self
    }

    #[cfg(test)]
    pub fn has_open_session(&self) -> bool {
        self.session.is_some()
    }
}

impl<C: Connector> SampleSource for DeviceSampler<C> {
    fn sample(&mut self) -> Result<Sample, SampleError> {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => self.connector.connect(&self.endpoint)?,
        };

        let reply = match session.exchange() {
            Ok(reply) => reply,
            Err(e) => {
                debug!("exchange failed in state {:?}", session.state());
                session.close();
                return Err(e.into());
            }
        };

        let line = reply.to_text();
        debug!("reply: {line:?}");
        let parsed = parse(&line, &self.site, self.policy);

        match (self.mode, &parsed) {
            (SessionMode::KeepOpen, Ok(_)) => self.session = Some(session),
            _ => session.close(),
        }
        Ok(parsed?)
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
