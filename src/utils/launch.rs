//! Launching apps under debugserver
//!
//! The app is started through the remote serial protocol and then simply
//! continued; the host only relays what the process prints and how it ends.

use std::time::Duration;

use futures::Stream;
use tracing::{debug, info, warn};

use crate::{
    IdeviceError, Session, SessionState,
    debug_proxy::{DebugProxyClient, hex_decode},
};

use super::installation::lookup_executable;

/// Something the launched process did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Bytes the process wrote to stdout or stderr
    Output(Vec<u8>),
    Exited(i32),
    Terminated { signal: u8, reason: Option<String> },
    Stopped { signal: u8, info: Vec<(String, String)> },
}

/// How the process ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Terminated { signal: u8, reason: Option<String> },
    Stopped { signal: u8, info: Vec<(String, String)> },
}

impl ExitStatus {
    /// The exit code, `None` if a signal ended or stopped the process
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(c) => Some(*c),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(c) => write!(f, "Process returned {c}."),
            Self::Terminated { signal, reason } => {
                write!(f, "Process terminated with signal {signal:#04x}")?;
                match reason {
                    Some(r) => write!(f, " ({r})."),
                    None => write!(f, "."),
                }
            }
            Self::Stopped { signal, info } => {
                write!(f, "Program received signal {signal:#04x}.")?;
                for (k, v) in info {
                    write!(f, "\n{k}:{v}")?;
                }
                Ok(())
            }
        }
    }
}

/// A process running under debugserver
#[derive(Debug)]
pub struct ProcessHandle<'a> {
    session: &'a mut Session,
    client: DebugProxyClient,
    argv: Vec<String>,
    status: Option<ExitStatus>,
}

/// Launches the installed app `bundle_id` with `args`
///
/// # Errors
/// * `LaunchFailed` if the app isn't installed or debugserver can't start it
/// * `AttachFailed` if no debug service can be started
pub async fn launch<'a>(
    session: &'a mut Session,
    bundle_id: &str,
    args: &[String],
) -> Result<ProcessHandle<'a>, IdeviceError> {
    session.ensure_active()?;
    let executable = lookup_executable(session, bundle_id).await?;
    let mut client = start_debugserver(session).await?;

    client.start_no_ack_mode().await?;
    let environment = session.config().debug_environment.clone();
    for (key, value) in &environment {
        client.set_environment(key, value).await?;
    }
    client.disable_aslr().await?;

    let mut argv = vec![executable];
    argv.extend(args.iter().cloned());
    info!("Running {}", argv.join(" "));
    client.set_argv(&argv).await?;
    client.launch_success().await?;
    client.continue_process().await?;

    session.advance(SessionState::Launched)?;
    Ok(ProcessHandle {
        session,
        client,
        argv,
        status: None,
    })
}

/// Starts the secure debug proxy, falling back to the legacy service name
async fn start_debugserver(session: &mut Session) -> Result<DebugProxyClient, IdeviceError> {
    let first = match session.start_service::<DebugProxyClient>().await {
        Ok(c) => return Ok(c),
        Err(e) if e.ends_session() => return Err(e),
        Err(e) => e,
    };
    let legacy = session.config().services.debugserver_legacy.clone();
    debug!("Secure debugserver unavailable ({first}), trying {legacy}");
    match session.start_service_named::<DebugProxyClient>(&legacy).await {
        Ok(c) => Ok(c),
        Err(e) if e.ends_session() => Err(e),
        Err(e) => Err(IdeviceError::AttachFailed(format!(
            "{first}; {legacy}: {e}"
        ))),
    }
}

/// Parses `ss` of a stop reply as a signal number
fn signal_of(packet: &[u8]) -> Result<u8, IdeviceError> {
    packet
        .get(1..3)
        .and_then(|s| std::str::from_utf8(s).ok())
        .and_then(|s| u8::from_str_radix(s, 16).ok())
        .ok_or_else(|| {
            IdeviceError::ProtocolError(format!(
                "stop reply without a signal: {}",
                String::from_utf8_lossy(packet)
            ))
        })
}

/// Turns one stop reply or console packet into an event, `None` for packets
/// that carry nothing
pub fn parse_stop_reply(packet: &[u8]) -> Result<Option<ProcessEvent>, IdeviceError> {
    let Some(kind) = packet.first() else {
        return Ok(None);
    };
    let text = String::from_utf8_lossy(packet);
    match kind {
        b'O' if packet == b"OK" => Ok(None),
        b'O' => Ok(Some(ProcessEvent::Output(hex_decode(&packet[1..])?))),
        b'W' => {
            let code = text[1..].split(';').next().unwrap_or_default();
            let code = u32::from_str_radix(code, 16)
                .map_err(|_| IdeviceError::ProtocolError(format!("bad exit reply {text}")))?;
            Ok(Some(ProcessEvent::Exited(code as i32)))
        }
        b'X' => {
            let signal = signal_of(packet)?;
            let reason = text.split_once(';').map(|(_, r)| r.to_string());
            Ok(Some(ProcessEvent::Terminated { signal, reason }))
        }
        b'S' => Ok(Some(ProcessEvent::Stopped {
            signal: signal_of(packet)?,
            info: Vec::new(),
        })),
        b'T' => {
            let signal = signal_of(packet)?;
            let info = text
                .get(3..)
                .unwrap_or_default()
                .split(';')
                .filter_map(|pair| pair.split_once(':'))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            Ok(Some(ProcessEvent::Stopped { signal, info }))
        }
        b'F' => Err(IdeviceError::ProtocolError(
            "File-I/O requests are not supported".into(),
        )),
        _ => Err(IdeviceError::ProtocolError(format!(
            "unexpected stop reply {text}"
        ))),
    }
}

impl<'a> ProcessHandle<'a> {
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// The final status, once the process has ended
    pub fn exit_status(&self) -> Option<&ExitStatus> {
        self.status.as_ref()
    }

    /// Waits for the next event, `None` after the process has ended
    ///
    /// Every `liveness_interval` of silence the device is pinged over lockdown.
    ///
    /// # Errors
    /// * `Timeout` if the output idle timeout passes without a packet, or the
    ///   device stops answering pings
    /// * `Cancelled`/`Disconnected` if the session goes away
    pub async fn next_event(&mut self) -> Result<Option<ProcessEvent>, IdeviceError> {
        if self.status.is_some() {
            return Ok(None);
        }
        let limit = self.session.config().output_idle_limit();
        let interval = self.session.config().liveness_interval;
        let mut silent = Duration::ZERO;
        loop {
            let wait = match limit {
                Some(limit) => limit.saturating_sub(silent).min(interval),
                None => interval,
            };
            let packet = match self.client.read_packet_within(Some(wait)).await {
                Ok(packet) => packet,
                Err(IdeviceError::Timeout) => {
                    silent += wait;
                    if limit.is_some_and(|limit| silent >= limit) {
                        return Err(IdeviceError::Timeout);
                    }
                    debug!("No output for {silent:?}, checking the device");
                    self.session.ping().await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            silent = Duration::ZERO;
            let Some(event) = parse_stop_reply(&packet)? else {
                continue;
            };
            let status = match &event {
                ProcessEvent::Output(_) => return Ok(Some(event)),
                ProcessEvent::Exited(c) => ExitStatus::Exited(*c),
                ProcessEvent::Terminated { signal, reason } => ExitStatus::Terminated {
                    signal: *signal,
                    reason: reason.clone(),
                },
                ProcessEvent::Stopped { signal, info } => ExitStatus::Stopped {
                    signal: *signal,
                    info: info.clone(),
                },
            };
            info!("{status}");
            self.status = Some(status);
            if let Err(e) = self.session.advance(SessionState::Terminated) {
                debug!("Not marking the session terminated: {e}");
            }
            return Ok(Some(event));
        }
    }

    /// The process output as it arrives, ending when the process does
    pub fn output_stream(&mut self) -> impl Stream<Item = Result<Vec<u8>, IdeviceError>> + '_ {
        async_stream::try_stream! {
            while let Some(event) = self.next_event().await? {
                if let ProcessEvent::Output(bytes) = event {
                    yield bytes;
                }
            }
        }
    }

    /// Like [`Self::output_stream`], consuming the handle
    pub fn into_output_stream(mut self) -> impl Stream<Item = Result<Vec<u8>, IdeviceError>> + 'a {
        async_stream::try_stream! {
            while let Some(event) = self.next_event().await? {
                if let ProcessEvent::Output(bytes) = event {
                    yield bytes;
                }
            }
        }
    }

    /// Kills the process
    pub async fn kill(&mut self) -> Result<(), IdeviceError> {
        if self.status.is_some() {
            return Ok(());
        }
        warn!("Killing {}", self.argv.first().map(String::as_str).unwrap_or("process"));
        self.client.kill().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_output_is_decoded() {
        assert_eq!(
            parse_stop_reply(b"O48656c6c6f0a").unwrap(),
            Some(ProcessEvent::Output(b"Hello\n".to_vec()))
        );
        assert_eq!(parse_stop_reply(b"OK").unwrap(), None);
        assert_eq!(parse_stop_reply(b"").unwrap(), None);
    }

    #[test]
    fn terminal_replies() {
        assert_eq!(parse_stop_reply(b"W00").unwrap(), Some(ProcessEvent::Exited(0)));
        assert_eq!(parse_stop_reply(b"W2a").unwrap(), Some(ProcessEvent::Exited(42)));
        assert_eq!(
            parse_stop_reply(b"X09;description:killed").unwrap(),
            Some(ProcessEvent::Terminated {
                signal: 9,
                reason: Some("description:killed".into())
            })
        );
        assert_eq!(
            parse_stop_reply(b"T0bthread:1f03;name:main;").unwrap(),
            Some(ProcessEvent::Stopped {
                signal: 11,
                info: vec![
                    ("thread".into(), "1f03".into()),
                    ("name".into(), "main".into())
                ]
            })
        );
        assert!(matches!(
            parse_stop_reply(b"Fopen,1234"),
            Err(IdeviceError::ProtocolError(_))
        ));
    }

    #[test]
    fn exit_status_text() {
        assert_eq!(ExitStatus::Exited(3).to_string(), "Process returned 3.");
        assert_eq!(ExitStatus::Exited(3).code(), Some(3));
        let t = ExitStatus::Terminated {
            signal: 9,
            reason: None,
        };
        assert_eq!(t.code(), None);
        assert_eq!(t.to_string(), "Process terminated with signal 0x09.");
    }
}
