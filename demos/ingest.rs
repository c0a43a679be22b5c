// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connects to an RTSP server, plays its video and audio through logging
//! decoders, and tears down on Ctrl+C.

use std::time::Duration;

use anyhow::Error;
use clap::Parser;
use log::{debug, error, info};
use rtsp_ingest::Timestamp;
use rtsp_ingest::client::{Session, SessionOptions, TrackSelection};
use rtsp_ingest::pipeline::{AudioDecoder, DecodeError, Pipeline, VideoDecoder};
use rtsp_ingest::queue::OverflowPolicy;

#[derive(Parser)]
struct Opts {
    /// `rtsp://` URL to connect to.
    #[arg(long)]
    url: url::Url,

    /// Which tracks to play: `video`, `audio`, or `both`.
    #[arg(long, default_value = "both")]
    tracks: TrackSelection,

    /// Bound on each queue; when full, the oldest unit is dropped.
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Seconds without data before giving up.
    #[arg(long, default_value_t = 20)]
    read_timeout_secs: u64,
}

/// Logs what a real decoder would be asked to do.
struct LoggingVideo;

impl VideoDecoder for LoggingVideo {
    /// Access unit size in bytes.
    type Picture = usize;

    fn submit_video_parameter_sets(
        &mut self,
        vps: Option<&[u8]>,
        sps: &[u8],
        pps: &[u8],
    ) -> Result<(), DecodeError> {
        info!(
            "video parameter sets: vps={} sps={} pps={} bytes",
            vps.map_or(0, <[u8]>::len),
            sps.len(),
            pps.len()
        );
        Ok(())
    }

    fn submit_access_unit(
        &mut self,
        access_unit: &[u8],
        _pts: Timestamp,
        _dts: Timestamp,
    ) -> Result<Option<usize>, DecodeError> {
        Ok(Some(access_unit.len()))
    }
}

struct LoggingAudio;

impl AudioDecoder for LoggingAudio {
    type Samples = usize;

    fn submit_audio_access_unit(
        &mut self,
        access_unit: &[u8],
        _pts: Timestamp,
    ) -> Result<Option<usize>, DecodeError> {
        Ok(Some(access_unit.len()))
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = main_inner().await {
        error!("Fatal: {e:#}");
        std::process::exit(1);
    }
    info!("Done");
}

async fn main_inner() -> Result<(), Error> {
    let opts = Opts::parse();
    let options = SessionOptions::default()
        .tracks(opts.tracks)
        .queue_capacity(opts.queue_capacity)
        .overflow(OverflowPolicy::DropOldest)
        .read_timeout(Duration::from_secs(opts.read_timeout_secs));
    let mut session = Session::connect(opts.url, options).await?;
    session.options().await?;
    let sdp = session.describe().await?;
    info!("SDP: {sdp:#?}");
    session.setup_all().await?;
    let pipeline = Pipeline::start(session, Some(LoggingVideo), Some(LoggingAudio)).await?;

    let video = pipeline.video_frames();
    let audio = pipeline.audio_samples();
    let reader = tokio::task::spawn_blocking(move || {
        let (mut pictures, mut samples) = (0u64, 0u64);
        let audio_wait = match video {
            Some(_) => Duration::ZERO,
            None => Duration::from_millis(50),
        };
        loop {
            let mut open = false;
            if let Some(q) = &video {
                open |= !q.is_closed() || !q.is_empty();
                if let Some(f) = q.dequeue_timeout(Duration::from_millis(50)) {
                    pictures += 1;
                    debug!("picture poc={} pts={} ({} bytes)", f.poc, f.pts, f.payload);
                }
            }
            if let Some(q) = &audio {
                open |= !q.is_closed() || !q.is_empty();
                while let Some(s) = q.dequeue_timeout(audio_wait) {
                    samples += 1;
                    debug!("audio pts={} ({} bytes)", s.pts, s.samples);
                }
            }
            if !open {
                return (pictures, samples);
            }
        }
    });

    let mut check = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping");
                break;
            }
            _ = check.tick() => {
                if pipeline.is_finished() {
                    break;
                }
            }
        }
    }
    let report = pipeline.stop().await;
    let (pictures, samples) = reader.await?;
    info!(
        "{pictures} pictures, {samples} audio units; video {:?}, audio {:?}",
        report.video, report.audio
    );
    let stats = report.network?;
    info!("network: {stats:?}");
    Ok(())
}
