#![forbid(unsafe_code)]

//! One-shot enrollment check: connect, enroll finger 1 and print what the bridge would return.
//!
//! Usage: `fpbridge_enroll_check [template_out.b64]`

use std::env;
use std::fs;

use fpbridge_adapter::{BridgeConfig, BridgeRuntime, CaptureRequest};
use tracing_subscriber::EnvFilter;

const PREVIEW_CHARS: usize = 50;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let out_path = env::args().nth(1);
    let runtime = BridgeRuntime::simulated(BridgeConfig::from_env()?);

    let init = runtime.initialize_scanner();
    if !init.success {
        return Err(init.message.into());
    }
    println!("{}", init.device_info.unwrap_or_default());

    let result = runtime.capture_fingerprint(CaptureRequest {
        subject_id: Some("CHECK".to_string()),
        finger_index: Some(1),
    });
    runtime.disconnect_scanner();
    if !result.success {
        return Err(format!("enrollment {}: {}", result.status, result.message).into());
    }

    let template_b64 = result.template_data.unwrap_or_default();
    println!("template size: {} bytes", result.template_size.unwrap_or(0));
    println!("quality: {}%", result.quality_score.unwrap_or(0));
    let preview: String = template_b64.chars().take(PREVIEW_CHARS).collect();
    println!("template (base64): {preview}...");

    if let Some(path) = out_path {
        fs::write(&path, &template_b64)?;
        println!("template written to {path}");
    }
    Ok(())
}
