//! Streaming supervisor (C6): validates start parameters, resolves DNS,
//! writes the runtime files the encoder/bonder read, and drives the
//! streaming state machine (Idle → Starting → Streaming → Stopping →
//! Idle). `Starting` is a logical phase — validation and DNS lookup
//! either complete synchronously into `Streaming` or bail back to
//! `Idle` without side effects.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use wire_protocol::StartParams;

use crate::config::Setup;
use crate::pipelines::Pipeline;
use crate::process_runner::{self, Signal, Supervisor};

const BONDER_COOLDOWN: Duration = Duration::from_millis(100);
const ENCODER_COOLDOWN: Duration = Duration::from_secs(2);

const DELAY_RANGE: std::ops::RangeInclusive<i32> = -2000..=2000;
const MAX_BR_RANGE: std::ops::RangeInclusive<i64> = 300..=12000;
const SRT_LATENCY_RANGE: std::ops::RangeInclusive<i64> = 100..=10_000;
const SRTLA_PORT_RANGE: std::ops::RangeInclusive<u32> = 1..=65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingPhase {
    Idle,
    Streaming,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid delay range: {0}")]
    Delay(i32),
    #[error("unknown pipeline: {0}")]
    UnknownPipeline(String),
    #[error("invalid bitrate range: {0}")]
    MaxBr(String),
    #[error("invalid srt latency range: {0}")]
    SrtLatency(i64),
    #[error("srtla_addr is required")]
    SrtlaAddrEmpty,
    #[error("failed to resolve srtla_addr: {0}")]
    DnsFailure(String),
    #[error("invalid srtla_port range: {0}")]
    SrtlaPort(u32),
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StartError {
    #[error("already streaming")]
    AlreadyStreaming,
    #[error("an update is in progress")]
    UpdateInProgress,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("no enabled uplinks")]
    NoUplinks,
    #[error("failed to write runtime file: {0}")]
    Io(String),
}

/// A [`StartParams`] that has passed every validation rule and is ready
/// to be persisted and acted on.
#[derive(Debug, Clone)]
pub struct ValidatedStart {
    pub delay: i32,
    pub pipeline_id: String,
    pub pipeline_path: std::path::PathBuf,
    pub max_br: i64,
    pub srt_latency: i64,
    pub srt_streamid: String,
    pub srtla_addr: String,
    pub srtla_port: u32,
}

/// Field-by-field validation, mirroring §4.6's table. DNS resolution is
/// injected as `resolve` so tests can avoid a real network lookup.
pub async fn validate_start<F, Fut>(
    params: &StartParams,
    pipelines: &[Pipeline],
    resolve: F,
) -> Result<ValidatedStart, ValidationError>
where
    F: FnOnce(String) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<Ipv4Addr>, String>>,
{
    if !DELAY_RANGE.contains(&params.delay) {
        return Err(ValidationError::Delay(params.delay));
    }
    let pipeline_path = crate::pipelines::resolve(pipelines, &params.pipeline)
        .ok_or_else(|| ValidationError::UnknownPipeline(params.pipeline.clone()))?;
    if !MAX_BR_RANGE.contains(&params.max_br) {
        return Err(ValidationError::MaxBr(String::new()));
    }
    if !SRT_LATENCY_RANGE.contains(&params.srt_latency) {
        return Err(ValidationError::SrtLatency(params.srt_latency));
    }
    if params.srtla_addr.is_empty() {
        return Err(ValidationError::SrtlaAddrEmpty);
    }
    if !SRTLA_PORT_RANGE.contains(&params.srtla_port) {
        return Err(ValidationError::SrtlaPort(params.srtla_port));
    }
    let resolved = resolve(params.srtla_addr.clone())
        .await
        .map_err(ValidationError::DnsFailure)?;
    if resolved.is_empty() {
        return Err(ValidationError::DnsFailure(format!(
            "no addresses for {}",
            params.srtla_addr
        )));
    }

    Ok(ValidatedStart {
        delay: params.delay,
        pipeline_id: params.pipeline.clone(),
        pipeline_path,
        max_br: params.max_br,
        srt_latency: params.srt_latency,
        srt_streamid: params.srt_streamid.clone(),
        srtla_addr: params.srtla_addr.clone(),
        srtla_port: params.srtla_port,
    })
}

/// Resolve a hostname to its IPv4 addresses via the system resolver.
/// The production `resolve` argument to [`validate_start`].
pub async fn resolve_via_system_dns(host: String) -> Result<Vec<Ipv4Addr>, String> {
    use std::net::ToSocketAddrs;
    tokio::task::spawn_blocking(move || {
        (host.as_str(), 0u16)
            .to_socket_addrs()
            .map(|addrs| {
                addrs
                    .filter_map(|a| match a.ip() {
                        std::net::IpAddr::V4(v4) => Some(v4),
                        std::net::IpAddr::V6(_) => None,
                    })
                    .collect()
            })
            .map_err(|e| e.to_string())
    })
    .await
    .unwrap_or_else(|e| Err(e.to_string()))
}

/// Rewrite the uplink-IP file from the currently-enabled interfaces.
/// Must contain at least one line for `start` to succeed.
pub fn write_uplinks_file(path: &Path, ips: &[Ipv4Addr]) -> Result<(), std::io::Error> {
    let mut contents = String::new();
    for ip in ips {
        contents.push_str(&ip.to_string());
        contents.push('\n');
    }
    crate::config::atomic_write(path, contents.as_bytes())
}

/// Rewrite the bitrate file: two lines, min then max, in bits/s.
/// `min_br_kbps` is fixed at half of `max_br_kbps` per the encoder's
/// expected CBR/VBR floor convention in this codebase.
pub fn write_bitrate_file(path: &Path, max_br_kbps: i64) -> Result<(), std::io::Error> {
    let max_bps = max_br_kbps * 1000;
    let min_bps = max_bps / 2;
    let contents = format!("{min_bps}\n{max_bps}\n");
    crate::config::atomic_write(path, contents.as_bytes())
}

/// Build the encoder's argv per §6.
pub fn encoder_argv(
    encoder_path: &Path,
    pipeline_path: &Path,
    delay: i32,
    bitrate_file: &Path,
    srt_latency: i64,
    srt_streamid: &str,
) -> Vec<String> {
    let mut argv = vec![
        encoder_path.display().to_string(),
        pipeline_path.display().to_string(),
        "127.0.0.1".to_owned(),
        "9000".to_owned(),
        "-d".to_owned(),
        delay.to_string(),
        "-b".to_owned(),
        bitrate_file.display().to_string(),
        "-l".to_owned(),
        srt_latency.to_string(),
    ];
    if !srt_streamid.is_empty() {
        argv.push("-s".to_owned());
        argv.push(srt_streamid.to_owned());
    }
    argv
}

/// Build the bonder's argv per §6.
pub fn bonder_argv(
    bonder_path: &Path,
    srtla_addr: &str,
    srtla_port: u32,
    uplinks_file: &Path,
) -> Vec<String> {
    vec![
        bonder_path.display().to_string(),
        "9000".to_owned(),
        srtla_addr.to_owned(),
        srtla_port.to_string(),
        uplinks_file.display().to_string(),
    ]
}

/// Owns the bonder/encoder supervisors and the shared `running` flag they
/// both watch. One instance lives in `AppState` for the life of the
/// process; `begin`/`stop` drive it through Idle/Streaming.
pub struct StreamingRuntime {
    phase: StreamingPhase,
    running_tx: watch::Sender<bool>,
    bonder: Option<Arc<Supervisor>>,
    encoder: Option<Arc<Supervisor>>,
}

impl StreamingRuntime {
    pub fn new() -> Self {
        let (running_tx, _rx) = watch::channel(false);
        Self {
            phase: StreamingPhase::Idle,
            running_tx,
            bonder: None,
            encoder: None,
        }
    }

    pub fn phase(&self) -> StreamingPhase {
        self.phase
    }

    pub fn is_streaming(&self) -> bool {
        self.phase == StreamingPhase::Streaming
    }

    /// `start(params)`: writes the runtime files, spawns bonder and
    /// encoder supervisors, and flips the shared running flag. Only valid
    /// from Idle.
    pub fn begin(
        &mut self,
        setup: &Setup,
        validated: &ValidatedStart,
        enabled_ips: &[Ipv4Addr],
    ) -> Result<(), StartError> {
        if self.is_streaming() {
            return Err(StartError::AlreadyStreaming);
        }
        if enabled_ips.is_empty() {
            return Err(StartError::NoUplinks);
        }
        write_uplinks_file(&setup.uplinks_file, enabled_ips)?;
        write_bitrate_file(&setup.bitrate_file, validated.max_br)?;

        let bonder_argv = bonder_argv(
            &setup.bonder_path,
            &validated.srtla_addr,
            validated.srtla_port,
            &setup.uplinks_file,
        );
        let encoder_argv = encoder_argv(
            &setup.encoder_path,
            &validated.pipeline_path,
            validated.delay,
            &setup.bitrate_file,
            validated.srt_latency,
            &validated.srt_streamid,
        );

        self.running_tx.send(true).ok();
        let bonder = Arc::new(Supervisor::new("bonder", bonder_argv, BONDER_COOLDOWN));
        let encoder = Arc::new(Supervisor::new("encoder", encoder_argv, ENCODER_COOLDOWN));
        tokio::spawn(bonder.clone().run(self.running_tx.subscribe()));
        tokio::spawn(encoder.clone().run(self.running_tx.subscribe()));
        self.bonder = Some(bonder);
        self.encoder = Some(encoder);
        self.phase = StreamingPhase::Streaming;
        Ok(())
    }

    /// `stop()`: idempotent. Clears the running flag and cancels both
    /// supervisors' tokens as a belt-and-braces measure alongside the
    /// kill-by-name they issue internally.
    pub fn stop(&mut self) {
        self.running_tx.send(false).ok();
        if let Some(bonder) = self.bonder.take() {
            bonder.cancel();
        }
        if let Some(encoder) = self.encoder.take() {
            encoder.cancel();
        }
        self.phase = StreamingPhase::Idle;
    }
}

impl Default for StreamingRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl From<std::io::Error> for StartError {
    fn from(err: std::io::Error) -> Self {
        StartError::Io(err.to_string())
    }
}

/// `setBitrate`: rewrite the bitrate file then hang up the encoder.
/// Ordered — the write completes before the signal is sent.
pub async fn apply_bitrate_change(setup: &Setup, max_br: i64) -> std::io::Result<()> {
    write_bitrate_file(&setup.bitrate_file, max_br)?;
    process_runner::signal_by_name(&exe_name(&setup.encoder_path), Signal::Hangup).await;
    Ok(())
}

/// `updateUplinks`: rewrite the uplink-IP file then hang up the bonder.
pub async fn update_uplinks(setup: &Setup, enabled_ips: &[Ipv4Addr]) -> std::io::Result<()> {
    write_uplinks_file(&setup.uplinks_file, enabled_ips)?;
    process_runner::signal_by_name(&exe_name(&setup.bonder_path), Signal::Hangup).await;
    Ok(())
}

fn exe_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub fn validate_bitrate(max_br: i64) -> bool {
    MAX_BR_RANGE.contains(&max_br)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines::Pipeline;

    fn sample_pipelines() -> Vec<Pipeline> {
        vec![Pipeline {
            id: "abc123".to_owned(),
            name: "low_latency.conf".to_owned(),
            path: "/opt/pipelines/generic/low_latency.conf".into(),
        }]
    }

    fn valid_params() -> StartParams {
        StartParams {
            delay: 0,
            pipeline: "abc123".to_owned(),
            max_br: 4000,
            srt_latency: 500,
            srt_streamid: String::new(),
            srtla_addr: "relay.example.com".to_owned(),
            srtla_port: 5000,
        }
    }

    async fn fake_resolve(_host: String) -> Result<Vec<Ipv4Addr>, String> {
        Ok(vec!["1.2.3.4".parse().unwrap()])
    }

    #[tokio::test]
    async fn accepts_valid_params() {
        let result = validate_start(&valid_params(), &sample_pipelines(), fake_resolve).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn rejects_out_of_range_bitrate() {
        let mut params = valid_params();
        params.max_br = 50;
        let err = validate_start(&params, &sample_pipelines(), fake_resolve)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::MaxBr(_)));
    }

    #[tokio::test]
    async fn rejects_unknown_pipeline() {
        let mut params = valid_params();
        params.pipeline = "not-a-real-id".to_owned();
        let err = validate_start(&params, &sample_pipelines(), fake_resolve)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnknownPipeline(_)));
    }

    #[tokio::test]
    async fn rejects_dns_failure() {
        let params = valid_params();
        let err = validate_start(&params, &sample_pipelines(), |_| async {
            Err("NXDOMAIN".to_owned())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ValidationError::DnsFailure(_)));
    }

    #[tokio::test]
    async fn rejects_out_of_range_delay_and_port() {
        let mut params = valid_params();
        params.delay = 5000;
        assert!(matches!(
            validate_start(&params, &sample_pipelines(), fake_resolve)
                .await
                .unwrap_err(),
            ValidationError::Delay(5000)
        ));

        let mut params = valid_params();
        params.srtla_port = 0;
        assert!(matches!(
            validate_start(&params, &sample_pipelines(), fake_resolve)
                .await
                .unwrap_err(),
            ValidationError::SrtlaPort(0)
        ));
    }

    #[test]
    fn bitrate_file_second_line_is_max_times_1000() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bitrate");
        write_bitrate_file(&path, 6000).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[1], "6000000");
    }

    #[test]
    fn uplinks_file_has_one_line_per_enabled_ip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ips");
        write_uplinks_file(&path, &["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()])
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "10.0.0.1\n10.0.0.2\n");
    }

    #[test]
    fn encoder_argv_omits_streamid_flag_when_empty() {
        let argv = encoder_argv(
            Path::new("/opt/encoder"),
            Path::new("/opt/pipelines/generic/a.conf"),
            0,
            Path::new("/run/bitrate"),
            500,
            "",
        );
        assert!(!argv.contains(&"-s".to_owned()));
    }

    #[test]
    fn encoder_argv_includes_streamid_flag_when_present() {
        let argv = encoder_argv(
            Path::new("/opt/encoder"),
            Path::new("/opt/pipelines/generic/a.conf"),
            0,
            Path::new("/run/bitrate"),
            500,
            "stream-7",
        );
        assert!(argv.contains(&"-s".to_owned()));
        assert!(argv.contains(&"stream-7".to_owned()));
    }
}
