use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;

use crate::domain::traits::HealthProbe;
use crate::domain::traits::ProcessError;

/// `GET http://{host}:{port}/health`, healthy on any 2xx.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(request_timeout: Duration) -> Result<Self, Report<ProcessError>> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()
            .change_context(ProcessError::Health {
                message: "cannot build HTTP client".to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, host: &str, port: u16) -> Result<(), Report<ProcessError>> {
        let url = format!("http://{host}:{port}/health");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| {
                Report::new(ProcessError::Health {
                    message: format!("request failed: {e}"),
                })
            })
            .attach_printable_lazy(|| url.clone())?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Report::new(ProcessError::Health {
                message: format!("{url} returned {status}"),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;

    /// Serve one canned HTTP response on an ephemeral port.
    async fn serve_once(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("should bind ephemeral port");
        let port = listener.local_addr().expect("should have address").port();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response =
                    format!("HTTP/1.1 {status_line}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok");
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    fn probe() -> HttpHealthProbe {
        HttpHealthProbe::new(Duration::from_secs(2)).expect("should build probe")
    }

    #[test(tokio::test)]
    async fn success_status_is_healthy() {
        let port = serve_once("200 OK").await;
        probe().check("127.0.0.1", port).await.expect("200 should be healthy");
    }

    #[test(tokio::test)]
    async fn loading_status_is_unhealthy() {
        let port = serve_once("503 Service Unavailable").await;
        let err = probe()
            .check("127.0.0.1", port)
            .await
            .expect_err("503 should be unhealthy");
        assert!(err.current_context().to_string().contains("503"));
    }

    #[test(tokio::test)]
    async fn closed_port_is_unhealthy() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("should bind ephemeral port");
        let port = listener.local_addr().expect("should have address").port();
        drop(listener);

        assert!(probe().check("127.0.0.1", port).await.is_err());
    }
}
