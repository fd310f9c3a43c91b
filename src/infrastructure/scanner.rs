use crate::config::SecurityConfig;
use crate::services::scanner::VirusScanner;
use std::sync::Arc;
use tracing::info;

pub async fn setup_scanner(security_config: &SecurityConfig) -> Arc<dyn VirusScanner> {
    let scanner_service = crate::services::scanner::create_scanner(security_config);

    // Warm up scanner connection
    if security_config.enable_virus_scan {
        if scanner_service.health_check().await {
            info!("🦠 Virus scanner connected successfully");
        } else {
            tracing::warn!(
                "⚠️  Virus scanner unreachable! Uploads will be {} while it is down.",
                match security_config.scan_failure_policy {
                    crate::config::ScanFailurePolicy::FailOpen => "admitted with a warning",
                    crate::config::ScanFailurePolicy::FailClosed => "rejected",
                }
            );
        }
    } else {
        tracing::warn!("⚠️  Virus scanning disabled, uploads are recorded as 'skipped'");
    }

    scanner_service.into()
}
