use crate::config::SecurityConfig;
use crate::services::storage::BlobReader;
use anyhow::{Result, anyhow};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Result of a virus scan
#[derive(Debug, Clone)]
pub enum ScanResult {
    /// File is clean (no threats detected)
    Clean,
    /// File is infected with malware
    Infected { threat_name: String },
    /// Scan could not be completed
    Error { reason: String },
}

/// Trait for virus scanning implementations
#[async_trait::async_trait]
pub trait VirusScanner: Send + Sync {
    /// Scan content for malware using a stream
    async fn scan(&self, reader: BlobReader) -> Result<ScanResult>;

    /// Check if the scanner is available/healthy
    async fn health_check(&self) -> bool;
}

const CHUNK_SIZE: usize = 64 * 1024;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// ClamAV scanner using TCP socket (clamd)
///
/// Docker command to run ClamAV:
/// ```bash
/// docker run -d --name clamav -p 3310:3310 clamav/clamav:latest
/// ```
pub struct ClamAvScanner {
    host: String,
    port: u16,
}

impl ClamAvScanner {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.host, self.port);
        TcpStream::connect(&addr)
            .await
            .map_err(|e| anyhow!("Failed to connect to ClamAV at {}: {}", addr, e))
    }
}

/// Interprets a clamd reply such as `stream: OK` or `stream: Eicar-Signature FOUND`
pub fn parse_clamd_response(raw: &[u8]) -> Option<ScanResult> {
    let response = String::from_utf8_lossy(raw);
    let response = response.trim_end_matches('\0').trim();

    if response.is_empty() {
        return None;
    }

    if response.ends_with("OK") {
        Some(ScanResult::Clean)
    } else if let Some(body) = response.strip_suffix("FOUND") {
        let threat = body
            .split_once(':')
            .map(|(_, t)| t.trim())
            .filter(|t| !t.is_empty())
            .unwrap_or("Unknown threat");
        Some(ScanResult::Infected {
            threat_name: threat.to_string(),
        })
    } else {
        Some(ScanResult::Error {
            reason: response.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl VirusScanner for ClamAvScanner {
    async fn scan(&self, mut reader: BlobReader) -> Result<ScanResult> {
        let mut stream = self.connect().await?;

        // INSTREAM framing: zINSTREAM\0 then <len:u32 BE><data> chunks, terminated by a zero length
        stream.write_all(b"zINSTREAM\0").await?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut total_sent = 0usize;
        let mut write_error = None;

        loop {
            let n = reader
                .read(&mut buffer)
                .await
                .map_err(|e| anyhow!("Failed to read from source: {}", e))?;
            let frame = if n == 0 {
                stream.write_all(&0u32.to_be_bytes()).await
            } else {
                match stream.write_all(&(n as u32).to_be_bytes()).await {
                    Ok(()) => stream.write_all(&buffer[..n]).await,
                    Err(e) => Err(e),
                }
            };

            if let Err(e) = frame {
                // clamd closes early on size limits; the reason is still readable
                tracing::warn!("ClamAV write error after {} bytes: {}", total_sent, e);
                write_error = Some(e);
                break;
            }
            if n == 0 {
                break;
            }
            total_sent += n;
        }
        let _ = stream.flush().await;

        let mut response = Vec::new();
        let read = tokio::time::timeout(RESPONSE_TIMEOUT, stream.read_to_end(&mut response)).await;

        match (parse_clamd_response(&response), read, write_error) {
            (Some(result), _, _) => {
                tracing::debug!("ClamAV scanned {} bytes: {:?}", total_sent, result);
                Ok(result)
            }
            (None, Err(_), _) => Err(anyhow!(
                "ClamAV scan timed out (total sent: {} bytes)",
                total_sent
            )),
            (None, Ok(Err(e)), _) => Err(anyhow!("ClamAV read error: {}", e)),
            (None, Ok(Ok(_)), Some(e)) => Err(anyhow!(
                "ClamAV write error: {}. ClamAV closed connection without sending a result.",
                e
            )),
            (None, Ok(Ok(_)), None) => Err(anyhow!(
                "ClamAV returned no response (total sent: {} bytes)",
                total_sent
            )),
        }
    }

    async fn health_check(&self) -> bool {
        let Ok(mut stream) = self.connect().await else {
            return false;
        };
        if stream.write_all(b"zPING\0").await.is_err() || stream.flush().await.is_err() {
            return false;
        }

        let mut response = [0u8; 16];
        match stream.read(&mut response).await {
            Ok(n) => String::from_utf8_lossy(&response[..n]).contains("PONG"),
            Err(_) => false,
        }
    }
}

/// No-op scanner for development/testing
pub struct NoOpScanner;

#[async_trait::async_trait]
impl VirusScanner for NoOpScanner {
    async fn scan(&self, _reader: BlobReader) -> Result<ScanResult> {
        tracing::warn!("NoOpScanner: Skipping virus scan (development mode)");
        Ok(ScanResult::Clean)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Factory function to create appropriate scanner based on config
pub fn create_scanner(config: &SecurityConfig) -> Box<dyn VirusScanner> {
    match config.virus_scanner_type.to_lowercase().as_str() {
        "clamav" => Box::new(ClamAvScanner::new(
            config.clamav_host.clone(),
            config.clamav_port,
        )),
        "noop" | "none" | "disabled" => Box::new(NoOpScanner),
        other => {
            tracing::warn!("Unknown scanner type '{}', using NoOpScanner", other);
            Box::new(NoOpScanner)
        }
    }
}
