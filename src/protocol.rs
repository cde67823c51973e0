//! Handshake lines between the sidecar and its parent
//!
//! The sidecar writes zero or more `FORWARD <service>:<remote>:<local>`
//! lines followed by exactly one `READY` line on stdout. Nothing may be
//! written after `READY`.

use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

/// Protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("cannot emit '{0}' after READY")]
    AfterReady(String),

    #[error("failed to write handshake: {0}")]
    Write(#[from] std::io::Error),

    #[error("malformed handshake line: '{0}'")]
    Malformed(String),
}

/// One handshake line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    Forward {
        service: String,
        remote_port: u16,
        local_port: u16,
    },
    Ready,
}

impl fmt::Display for Emission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Emission::Forward {
                service,
                remote_port,
                local_port,
            } => write!(f, "FORWARD {service}:{remote_port}:{local_port}"),
            Emission::Ready => f.write_str("READY"),
        }
    }
}

impl FromStr for Emission {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == "READY" {
            return Ok(Emission::Ready);
        }

        let malformed = || ProtocolError::Malformed(line.to_string());
        let body = line.strip_prefix("FORWARD ").ok_or_else(malformed)?;

        // Service names cannot contain ':', so split from the right
        let mut parts = body.rsplitn(3, ':');
        let local_port = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;
        let remote_port = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;
        let service = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;

        Ok(Emission::Forward {
            service: service.to_string(),
            remote_port,
            local_port,
        })
    }
}

struct HandshakeState {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    emitted: Vec<Emission>,
}

/// Writer side of the handshake
///
/// Emissions are serialized behind a lock and flushed one line at a time.
/// Once `READY` is written every later emission fails.
pub struct Handshake {
    state: Mutex<HandshakeState>,
}

impl Handshake {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            state: Mutex::new(HandshakeState {
                writer: Box::new(writer),
                emitted: Vec::new(),
            }),
        }
    }

    /// Handshake on the process's stdout
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    /// Emit `FORWARD <service>:<remote>:<local>`
    pub async fn forward(
        &self,
        service: &str,
        remote_port: u16,
        local_port: u16,
    ) -> Result<(), ProtocolError> {
        self.emit(Emission::Forward {
            service: service.to_string(),
            remote_port,
            local_port,
        })
        .await
    }

    /// Emit `READY`
    pub async fn ready(&self) -> Result<(), ProtocolError> {
        self.emit(Emission::Ready).await
    }

    async fn emit(&self, emission: Emission) -> Result<(), ProtocolError> {
        let mut state = self.state.lock().await;
        if state.emitted.last() == Some(&Emission::Ready) {
            return Err(ProtocolError::AfterReady(emission.to_string()));
        }

        let line = format!("{emission}\n");
        state.writer.write_all(line.as_bytes()).await?;
        state.writer.flush().await?;

        debug!(line = %emission, "Handshake emitted");
        state.emitted.push(emission);
        Ok(())
    }

    /// Everything emitted so far, in order
    pub async fn emitted(&self) -> Vec<Emission> {
        self.state.lock().await.emitted.clone()
    }

    pub async fn is_ready(&self) -> bool {
        self.state.lock().await.emitted.last() == Some(&Emission::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_emission_display() {
        let forward = Emission::Forward {
            service: "svc1".to_string(),
            remote_port: 8080,
            local_port: 40123,
        };
        assert_eq!(forward.to_string(), "FORWARD svc1:8080:40123");
        assert_eq!(Emission::Ready.to_string(), "READY");
    }

    #[test]
    fn test_emission_parse() {
        assert_eq!("READY\n".parse::<Emission>().unwrap(), Emission::Ready);
        assert_eq!(
            "FORWARD svc1:8080:40123".parse::<Emission>().unwrap(),
            Emission::Forward {
                service: "svc1".to_string(),
                remote_port: 8080,
                local_port: 40123,
            }
        );
    }

    #[test]
    fn test_emission_parse_rejects_garbage() {
        for line in ["", "READY now", "FORWARD svc1:8080", "FORWARD :1:2", "FORWARD a:b:c"] {
            assert!(
                matches!(line.parse::<Emission>(), Err(ProtocolError::Malformed(_))),
                "{line:?} should be malformed"
            );
        }
    }

    #[tokio::test]
    async fn test_forward_lines_precede_ready() {
        let (writer, mut reader) = tokio::io::duplex(1024);
        let handshake = Handshake::new(writer);

        handshake.forward("svc1", 8080, 40000).await.unwrap();
        handshake.forward("svc1", 9090, 40001).await.unwrap();
        handshake.ready().await.unwrap();
        drop(handshake);

        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(
            out,
            "FORWARD svc1:8080:40000\nFORWARD svc1:9090:40001\nREADY\n"
        );
    }

    #[tokio::test]
    async fn test_nothing_after_ready() {
        let handshake = Handshake::new(tokio::io::sink());

        handshake.ready().await.unwrap();
        assert!(handshake.is_ready().await);

        assert!(matches!(
            handshake.forward("svc1", 8080, 40000).await,
            Err(ProtocolError::AfterReady(_))
        ));
        assert!(matches!(
            handshake.ready().await,
            Err(ProtocolError::AfterReady(_))
        ));
        assert_eq!(handshake.emitted().await, vec![Emission::Ready]);
    }
}
