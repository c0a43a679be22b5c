// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Feeds depacketized media to caller-supplied decoders.
//!
//! After [`Pipeline::start`], the session's network task fills one queue per
//! codec. A dedicated thread per codec drains its queue: video NAL units are
//! grouped into access units, ordered by picture order count, and decoded;
//! AAC access units are decoded as they arrive. Decoded output lands on a
//! [`Queue`] the caller reads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, trace, warn};

use crate::client::{DemuxStats, Playing, SdpInfo, Session, SessionState, VideoTrack};
use crate::codec::h265::nal::UnitType;
use crate::codec::{AudioFrame, NalUnit, START_CODE, VideoCodec, h264, h265};
use crate::poc::PocContext;
use crate::queue::Queue;
use crate::reorder::{Frame, ReorderBuffer};
use crate::{Error, ErrorInt, Timestamp};

/// How often consumer threads check the stop flag while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An error returned by a decoder; it drops only the unit being decoded.
pub type DecodeError = Box<dyn std::error::Error + Send + Sync>;

/// A caller-supplied H.264 or H.265 decoder, driven from the video thread.
pub trait VideoDecoder: Send + 'static {
    type Picture: Send + 'static;

    /// (Re)configures the decoder. NAL units are passed without start codes;
    /// `vps` is only for H.265.
    ///
    /// Called before the first access unit and whenever the active
    /// parameter sets change.
    fn submit_video_parameter_sets(
        &mut self,
        vps: Option<&[u8]>,
        sps: &[u8],
        pps: &[u8],
    ) -> Result<(), DecodeError>;

    /// Decodes one access unit in decode order: Annex B NAL units, each
    /// prefixed with [`START_CODE`], without parameter sets.
    fn submit_access_unit(
        &mut self,
        access_unit: &[u8],
        pts: Timestamp,
        dts: Timestamp,
    ) -> Result<Option<Self::Picture>, DecodeError>;
}

/// A caller-supplied AAC decoder, driven from the audio thread.
pub trait AudioDecoder: Send + 'static {
    type Samples: Send + 'static;

    /// Decodes one raw AAC access unit (no ADTS header).
    fn submit_audio_access_unit(
        &mut self,
        access_unit: &[u8],
        pts: Timestamp,
    ) -> Result<Option<Self::Samples>, DecodeError>;
}

/// A decoder which accepts everything and produces nothing, for a stream the
/// caller doesn't want decoded.
#[derive(Copy, Clone, Debug, Default)]
pub struct Discard;

impl VideoDecoder for Discard {
    type Picture = ();

    fn submit_video_parameter_sets(
        &mut self,
        _vps: Option<&[u8]>,
        _sps: &[u8],
        _pps: &[u8],
    ) -> Result<(), DecodeError> {
        Ok(())
    }

    fn submit_access_unit(
        &mut self,
        _access_unit: &[u8],
        _pts: Timestamp,
        _dts: Timestamp,
    ) -> Result<Option<()>, DecodeError> {
        Ok(None)
    }
}

impl AudioDecoder for Discard {
    type Samples = ();

    fn submit_audio_access_unit(
        &mut self,
        _access_unit: &[u8],
        _pts: Timestamp,
    ) -> Result<Option<()>, DecodeError> {
        Ok(None)
    }
}

/// Decoded audio with its presentation time.
#[derive(Clone, Debug)]
pub struct AudioSamples<A> {
    pub pts: Timestamp,
    pub samples: A,
}

/// Per-stream counters reported by [`Pipeline::stop`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamCounters {
    /// Units passed to the decoder without error.
    pub decoded: u64,

    /// Units discarded: before decoding could start, after loss, on parse or
    /// decode failure, or still queued at stop.
    pub dropped: u64,
}

#[derive(Debug)]
pub struct StopReport {
    /// The network task's result: its counters or the error that ended it.
    pub network: Result<DemuxStats, Error>,
    pub video: StreamCounters,
    pub audio: StreamCounters,
}

/// One consumer thread with its input and output queues.
struct Stage<I, O> {
    input: Arc<Queue<I>>,
    output: Arc<Queue<O>>,
    thread: Option<std::thread::JoinHandle<StreamCounters>>,
}

impl<I, O> Stage<I, O> {
    /// Clears the input and joins the thread. The stop flag must be set.
    ///
    /// The output is closed first so a consumer waiting for room in a full
    /// [`crate::queue::OverflowPolicy::Block`] queue wakes up.
    async fn stop(&mut self, name: &str) -> StreamCounters {
        let cleared = self.input.clear();
        self.output.close();
        let mut counters = match self.thread.take() {
            Some(t) => match tokio::task::spawn_blocking(move || t.join()).await {
                Ok(Ok(c)) => c,
                _ => {
                    error!("{name} consumer thread panicked");
                    StreamCounters::default()
                }
            },
            None => StreamCounters::default(),
        };
        counters.dropped += cleared as u64;
        counters
    }
}

/// A playing session with its decoding threads.
pub struct Pipeline<V: VideoDecoder, A: AudioDecoder> {
    playing: Playing,
    stop: Arc<AtomicBool>,
    video: Option<Stage<NalUnit, Frame<V::Picture>>>,
    audio: Option<Stage<AudioFrame, AudioSamples<A::Samples>>>,
}

impl<V: VideoDecoder, A: AudioDecoder> Pipeline<V, A> {
    /// Plays a set-up session and starts a consumer thread for each set-up
    /// stream which has a decoder.
    ///
    /// Streams without a decoder are discarded. Output queues use the
    /// session's queue capacity and overflow policy.
    pub async fn start(
        session: Session,
        video_decoder: Option<V>,
        audio_decoder: Option<A>,
    ) -> Result<Self, Error> {
        let capacity = session.session_options().get_queue_capacity();
        let overflow = session.session_options().get_overflow();
        let playing = session.play().await?;
        let stop = Arc::new(AtomicBool::new(false));

        let video = match (playing.video_queue(), video_decoder, &playing.sdp().video) {
            (Some(input), Some(decoder), Some(track)) => {
                let output = Arc::new(Queue::new(capacity, overflow));
                let consumer = VideoConsumer::new(track, decoder, output.clone())?;
                let thread = spawn("video", consumer, input.clone(), stop.clone())?;
                Some(Stage {
                    input,
                    output,
                    thread: Some(thread),
                })
            }
            (Some(input), _, _) => {
                debug!("no video decoder; discarding video");
                input.close();
                None
            }
            (None, _, _) => None,
        };
        let audio = match (playing.audio_queue(), audio_decoder) {
            (Some(input), Some(decoder)) => {
                let output = Arc::new(Queue::new(capacity, overflow));
                let consumer = AudioConsumer {
                    decoder,
                    output: output.clone(),
                    counters: StreamCounters::default(),
                };
                let thread = spawn("audio", consumer, input.clone(), stop.clone())?;
                Some(Stage {
                    input,
                    output,
                    thread: Some(thread),
                })
            }
            (Some(input), None) => {
                debug!("no audio decoder; discarding audio");
                input.close();
                None
            }
            (None, _) => None,
        };
        Ok(Pipeline {
            playing,
            stop,
            video,
            audio,
        })
    }

    pub fn sdp(&self) -> &SdpInfo {
        self.playing.sdp()
    }

    pub fn session_state(&self) -> SessionState {
        self.playing.state()
    }

    /// True once the network task has exited.
    pub fn is_finished(&self) -> bool {
        self.playing.is_finished()
    }

    /// Decoded pictures in display order. Closed once decoding ends.
    pub fn video_frames(&self) -> Option<Arc<Queue<Frame<V::Picture>>>> {
        self.video.as_ref().map(|s| s.output.clone())
    }

    /// Decoded audio in arrival order. Closed once decoding ends.
    pub fn audio_samples(&self) -> Option<Arc<Queue<AudioSamples<A::Samples>>>> {
        self.audio.as_ref().map(|s| s.output.clone())
    }

    /// Tears everything down in order: the network task (with `TEARDOWN`),
    /// then the consumer threads, whose queues are cleared and whose
    /// ordering state is reset.
    pub async fn stop(self) -> StopReport {
        let Pipeline {
            playing,
            stop,
            video,
            audio,
        } = self;
        let network = playing.stop().await;
        stop.store(true, Ordering::Release);
        let mut report = StopReport {
            network,
            video: StreamCounters::default(),
            audio: StreamCounters::default(),
        };
        if let Some(mut s) = video {
            report.video = s.stop("video").await;
        }
        if let Some(mut s) = audio {
            report.audio = s.stop("audio").await;
        }
        debug!("pipeline stopped: {report:?}");
        report
    }
}

/// The codec-specific half of a consumer thread.
trait Consumer {
    type Item;

    fn push(&mut self, item: Self::Item);

    /// Ends the stream. With `drain`, buffered output is emitted; otherwise
    /// it's discarded. Either way, the output queue is closed.
    fn finish(self, drain: bool) -> StreamCounters;
}

fn spawn<C>(
    name: &str,
    consumer: C,
    input: Arc<Queue<C::Item>>,
    stop: Arc<AtomicBool>,
) -> Result<std::thread::JoinHandle<StreamCounters>, Error>
where
    C: Consumer + Send + 'static,
    C::Item: Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("rtsp-ingest-{name}"))
        .spawn(move || consume(consumer, &input, &stop))
        .map_err(|e| wrap!(ErrorInt::Internal(e.into())))
}

/// Runs until `stop` is set or `input` is closed and drained.
fn consume<C: Consumer>(mut consumer: C, input: &Queue<C::Item>, stop: &AtomicBool) -> StreamCounters {
    loop {
        if stop.load(Ordering::Acquire) {
            return consumer.finish(false);
        }
        match input.dequeue_timeout(POLL_INTERVAL) {
            Some(item) => consumer.push(item),
            None if input.is_closed() => return consumer.finish(true),
            None => {}
        }
    }
}

enum VideoParameters {
    H264(h264::ParameterSets),
    H265(h265::ParameterSets),
}

/// `(vps, sps, pps)` NAL units, with start codes, as last submitted.
type SubmittedSets = (Option<Bytes>, Bytes, Bytes);

/// Ordering information for one access unit.
struct PictureInfo {
    poc: i64,

    /// Nothing before this picture can follow it in display order.
    flush: bool,
    sets: SubmittedSets,
}

struct VideoConsumer<D: VideoDecoder> {
    decoder: D,
    params: VideoParameters,
    poc: PocContext,
    reorder: ReorderBuffer<D::Picture>,
    output: Arc<Queue<Frame<D::Picture>>>,

    /// NAL units of the access unit being gathered, sharing one timestamp.
    pending: Vec<NalUnit>,

    /// False until an IDR (H.264) or IRAP (H.265) picture, and again after loss.
    started: bool,
    prev_dts: Option<Timestamp>,
    submitted: Option<SubmittedSets>,
    counters: StreamCounters,
}

impl<D: VideoDecoder> VideoConsumer<D> {
    /// Creates a consumer, seeding parameter sets from the SDP.
    fn new(
        track: &VideoTrack,
        decoder: D,
        output: Arc<Queue<Frame<D::Picture>>>,
    ) -> Result<Self, Error> {
        let Some(codec) = track.codec else {
            bail!(ErrorInt::InvalidArgument(format!(
                "can't decode {} video",
                track.encoding_name
            )));
        };
        let (mut params, max_depth) = match codec {
            VideoCodec::H264 => (
                VideoParameters::H264(h264::ParameterSets::new()),
                Some(h264::MAX_REORDER_DEPTH),
            ),
            VideoCodec::H265 => (VideoParameters::H265(h265::ParameterSets::new()), None),
        };
        for set in [&track.vps, &track.sps, &track.pps].into_iter().flatten() {
            if let Err(e) = update(&mut params, set) {
                warn!("ignoring bad parameter set from SDP: {e}");
            }
        }
        Ok(VideoConsumer {
            decoder,
            params,
            poc: PocContext::new(),
            reorder: ReorderBuffer::new(max_depth),
            output,
            pending: Vec::new(),
            started: false,
            prev_dts: None,
            submitted: None,
            counters: StreamCounters::default(),
        })
    }

    fn is_vcl(&self, nal: &NalUnit) -> bool {
        match self.params {
            VideoParameters::H264(_) => (1..=5).contains(&nal.unit_type),
            VideoParameters::H265(_) => nal.unit_type < 32,
        }
    }

    /// Computes the POC and parameter sets of the picture whose first slice
    /// is `slice`. Returns `None` if decoding can't start with it.
    fn picture_info(&mut self, slice: &NalUnit) -> Result<Option<PictureInfo>, String> {
        let decoding_start = !self.started;
        match &self.params {
            VideoParameters::H264(p) => {
                let is_idr = slice.unit_type == h264::UNIT_TYPE_IDR;
                if decoding_start && !is_idr {
                    return Ok(None);
                }
                let (Some(sps), Some(pps)) = (p.sps_nal(), p.pps_nal()) else {
                    return Err("no SPS and PPS received".to_owned());
                };
                let sets = (None, sps.clone(), pps.clone());
                let poc = p.picture_order_count(slice.nal(), &mut self.poc)?;
                Ok(Some(PictureInfo {
                    poc,
                    flush: is_idr,
                    sets,
                }))
            }
            VideoParameters::H265(p) => {
                let t = UnitType::try_from(slice.unit_type)?;
                if decoding_start && !t.is_irap() {
                    return Ok(None);
                }
                let (info, active) = p.slice(slice.nal())?;
                let poc = p.picture_order_count(&info, active.sps, &mut self.poc, decoding_start)?;
                Ok(Some(PictureInfo {
                    poc,
                    flush: t.is_idr() || t.is_bla() || decoding_start,
                    sets: (
                        active.vps_nal.cloned(),
                        active.sps_nal.clone(),
                        active.pps_nal.clone(),
                    ),
                }))
            }
        }
    }

    /// Decodes the gathered access unit, if it contains a picture.
    fn finish_access_unit(&mut self) {
        let nals = std::mem::take(&mut self.pending);
        let Some(first) = nals.iter().find(|n| self.is_vcl(n)) else {
            if !nals.is_empty() {
                trace!("skipping {} NAL unit(s) without a picture", nals.len());
            }
            return;
        };
        let pts = first.timestamp;
        let info = match self.picture_info(first) {
            Ok(Some(i)) => i,
            Ok(None) => {
                debug!("dropping video access unit at {pts} before a random access point");
                self.counters.dropped += 1;
                return;
            }
            Err(e) => {
                warn!("dropping video access unit at {pts}: {e}");
                self.counters.dropped += 1;
                return;
            }
        };
        self.started = true;

        if self.submitted.as_ref() != Some(&info.sets) {
            let (vps, sps, pps) = &info.sets;
            let strip = |b: &Bytes| b.slice(START_CODE.len()..);
            let (vps, sps, pps) = (vps.as_ref().map(strip), strip(sps), strip(pps));
            if let Err(e) = self
                .decoder
                .submit_video_parameter_sets(vps.as_deref(), &sps, &pps)
            {
                warn!("decoder rejected parameter sets: {e}");
                self.counters.dropped += 1;
                self.started = false;
                return;
            }
            if let VideoParameters::H265(p) = &self.params {
                self.reorder.set_max_depth(p.max_num_reorder_pics());
            }
            self.submitted = Some(info.sets);
        }

        let dts = match self.prev_dts {
            Some(prev) if pts.timestamp() <= prev.timestamp() => match prev.try_add(1) {
                Some(d) => d,
                None => {
                    warn!("DTS overflow after {prev}");
                    self.counters.dropped += 1;
                    return;
                }
            },
            _ => pts,
        };
        self.prev_dts = Some(dts);

        let mut au = Vec::with_capacity(nals.iter().map(|n| n.data.len()).sum());
        for n in &nals {
            au.extend_from_slice(&n.data);
        }
        let picture = match self.decoder.submit_access_unit(&au, pts, dts) {
            Ok(p) => p,
            Err(e) => {
                warn!("decoder failed on access unit at {pts}: {e}");
                self.counters.dropped += 1;
                return;
            }
        };
        self.counters.decoded += 1;
        let mut out = Vec::new();
        if info.flush {
            self.reorder.flush(&mut out);
        }
        if let Some(payload) = picture {
            let frame = Frame {
                poc: info.poc,
                dts,
                pts,
                payload,
            };
            self.reorder.push(frame, false, &mut out);
        }
        self.emit(out);
    }

    fn emit(&self, frames: Vec<Frame<D::Picture>>) {
        for f in frames {
            if self.output.enqueue(f).is_err() {
                trace!("video output closed");
                return;
            }
        }
    }
}

fn update(params: &mut VideoParameters, data: &Bytes) -> Result<bool, String> {
    match params {
        VideoParameters::H264(p) => p.update(data),
        VideoParameters::H265(p) => p.update(data),
    }
}

impl<D: VideoDecoder> Consumer for VideoConsumer<D> {
    type Item = NalUnit;

    fn push(&mut self, nal: NalUnit) {
        if self
            .pending
            .first()
            .is_some_and(|p| p.timestamp != nal.timestamp)
        {
            self.finish_access_unit();
        }
        if nal.loss > 0 {
            debug!(
                "{} RTP packet(s) lost before video NAL unit at {}; waiting for a random access point",
                nal.loss, nal.timestamp
            );
            if !self.pending.is_empty() {
                self.pending.clear();
                self.counters.dropped += 1;
            }
            self.started = false;
        }
        let mark = nal.mark;
        if nal.is_parameter_set() {
            match update(&mut self.params, &nal.data) {
                Ok(true) => debug!("new parameter set: {nal:?}"),
                Ok(false) => {}
                Err(e) => warn!("bad parameter set at {}: {e}", nal.timestamp),
            }
        } else {
            self.pending.push(nal);
        }
        if mark {
            self.finish_access_unit();
        }
    }

    fn finish(mut self, drain: bool) -> StreamCounters {
        let mut out = Vec::new();
        if drain {
            self.finish_access_unit();
            self.reorder.flush(&mut out);
        } else {
            if !self.pending.is_empty() {
                self.counters.dropped += 1;
            }
            self.reorder.clear();
        }
        self.emit(out);
        self.poc.reset();
        self.output.close();
        self.counters
    }
}

struct AudioConsumer<D: AudioDecoder> {
    decoder: D,
    output: Arc<Queue<AudioSamples<D::Samples>>>,
    counters: StreamCounters,
}

impl<D: AudioDecoder> Consumer for AudioConsumer<D> {
    type Item = AudioFrame;

    fn push(&mut self, frame: AudioFrame) {
        if frame.loss > 0 {
            debug!("{} RTP packet(s) lost before audio at {}", frame.loss, frame.timestamp);
        }
        match self
            .decoder
            .submit_audio_access_unit(&frame.data, frame.timestamp)
        {
            Ok(samples) => {
                self.counters.decoded += 1;
                if let Some(samples) = samples {
                    let _ = self.output.enqueue(AudioSamples {
                        pts: frame.timestamp,
                        samples,
                    });
                }
            }
            Err(e) => {
                warn!("decoder failed on audio at {}: {e}", frame.timestamp);
                self.counters.dropped += 1;
            }
        }
    }

    fn finish(self, _drain: bool) -> StreamCounters {
        self.output.close();
        self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SessionOptions;
    use crate::queue::OverflowPolicy;
    use crate::testutil::{
        FakeServer, H264_SPROP, H265_PPS, H265_SPS, H265_VPS, h264_slice, h265_slice,
        init_logging, listen, next_item, rtp_packet, ts90k,
    };
    use parking_lot::Mutex;

    /// `(vps, sps, pps)` as given to the decoder.
    type SetsCall = (Option<Vec<u8>>, Vec<u8>, Vec<u8>);

    /// Records what it's given; a "picture" is the access unit's pts.
    #[derive(Default)]
    struct Recorder {
        sets: Arc<Mutex<Vec<SetsCall>>>,
        units: Arc<Mutex<Vec<(i64, i64)>>>,
    }

    impl VideoDecoder for Recorder {
        type Picture = i64;

        fn submit_video_parameter_sets(
            &mut self,
            vps: Option<&[u8]>,
            sps: &[u8],
            pps: &[u8],
        ) -> Result<(), DecodeError> {
            self.sets
                .lock()
                .push((vps.map(<[u8]>::to_vec), sps.to_vec(), pps.to_vec()));
            Ok(())
        }

        fn submit_access_unit(
            &mut self,
            access_unit: &[u8],
            pts: Timestamp,
            dts: Timestamp,
        ) -> Result<Option<i64>, DecodeError> {
            assert!(access_unit.starts_with(&START_CODE));
            self.units.lock().push((pts.elapsed(), dts.elapsed()));
            Ok(Some(pts.elapsed()))
        }
    }

    fn track(seed: bool) -> VideoTrack {
        let (sps, pps) = h264::parse_sprop_parameter_sets(H264_SPROP).unwrap();
        VideoTrack {
            control: None,
            payload_type: 96,
            encoding_name: "h264".to_owned(),
            clock_rate: 90_000,
            codec: Some(VideoCodec::H264),
            vps: None,
            sps: seed.then_some(sps),
            pps: seed.then_some(pps),
        }
    }

    fn nal(data: &[u8], ts: i64, mark: bool, loss: u16) -> NalUnit {
        NalUnit {
            codec: VideoCodec::H264,
            unit_type: data[0] & 0b1_1111,
            data: [&START_CODE[..], data].concat().into(),
            timestamp: ts90k(ts),
            mark,
            loss,
        }
    }

    fn consumer(seed: bool) -> (VideoConsumer<Recorder>, Arc<Queue<Frame<i64>>>) {
        let output = Arc::new(Queue::unbounded());
        let c = VideoConsumer::new(&track(seed), Recorder::default(), output.clone()).unwrap();
        (c, output)
    }

    fn drain<T>(q: &Queue<T>) -> Vec<T> {
        std::iter::from_fn(|| q.try_dequeue()).collect()
    }

    #[test]
    fn orders_pictures() {
        init_logging();
        let (mut c, output) = consumer(false);
        let sets = c.decoder.sets.clone();
        let units = c.decoder.units.clone();
        let (sps, pps) = h264::parse_sprop_parameter_sets(H264_SPROP).unwrap();

        // A P slice before any IDR can't be decoded.
        c.push(nal(&h264_slice(0x41, 5, 3, 20), 0, true, 0));

        // SPS, PPS, and IDR share an access unit; then P and B in decode order.
        c.push(nal(&sps[4..], 3000, false, 0));
        c.push(nal(&pps[4..], 3000, false, 0));
        c.push(nal(&h264_slice(0x65, 7, 0, 0), 3000, true, 0));
        c.push(nal(&h264_slice(0x41, 5, 1, 8), 15_000, true, 0));
        c.push(nal(&h264_slice(0x01, 6, 2, 4), 9_000, true, 0));
        assert!(output.is_empty());

        let counters = c.finish(true);
        assert_eq!(
            counters,
            StreamCounters {
                decoded: 3,
                dropped: 1
            }
        );
        assert_eq!(&*sets.lock(), &[(None, sps[4..].to_vec(), pps[4..].to_vec())]);

        // The B frame's DTS is bumped past the P frame's.
        assert_eq!(
            &*units.lock(),
            &[(3000, 3000), (15_000, 15_000), (9_000, 15_001)]
        );
        let frames = drain(&output);
        let pts: Vec<i64> = frames.iter().map(|f| f.payload).collect();
        assert_eq!(pts, [3000, 9_000, 15_000]);
        let pocs: Vec<i64> = frames.iter().map(|f| f.poc).collect();
        assert_eq!(pocs, [0, 4, 8]);
        assert!(output.is_closed());
    }

    #[test]
    fn timestamp_change_ends_access_unit() {
        let (mut c, output) = consumer(true);
        c.push(nal(&h264_slice(0x65, 7, 0, 0), 0, false, 0));
        c.push(nal(&h264_slice(0x41, 5, 1, 2), 3000, false, 0));
        assert_eq!(c.counters.decoded, 1);
        c.push(nal(&h264_slice(0x65, 7, 0, 0), 6000, true, 0));

        // The IDR flushes the two earlier pictures.
        let pts: Vec<i64> = drain(&output).iter().map(|f| f.payload).collect();
        assert_eq!(pts, [0, 3000]);
        assert_eq!(c.finish(true).decoded, 3);
    }

    #[test]
    fn loss_waits_for_idr() {
        let (mut c, _output) = consumer(true);
        c.push(nal(&h264_slice(0x65, 7, 0, 0), 0, true, 0));
        c.push(nal(&h264_slice(0x41, 5, 1, 2), 3000, true, 2));
        c.push(nal(&h264_slice(0x41, 5, 2, 4), 6000, true, 0));
        c.push(nal(&h264_slice(0x65, 7, 0, 0), 9000, true, 0));
        let counters = c.finish(false);
        assert_eq!(
            counters,
            StreamCounters {
                decoded: 2,
                dropped: 2
            }
        );
    }

    #[test]
    fn missing_parameter_sets() {
        let (mut c, output) = consumer(false);
        c.push(nal(&h264_slice(0x65, 7, 0, 0), 0, true, 0));
        assert_eq!(c.counters.dropped, 1);
        assert!(c.decoder.units.lock().is_empty());
        c.finish(true);
        assert!(output.is_closed() && output.is_empty());
    }

    struct FailEmpty;

    impl AudioDecoder for FailEmpty {
        type Samples = usize;

        fn submit_audio_access_unit(
            &mut self,
            access_unit: &[u8],
            _pts: Timestamp,
        ) -> Result<Option<usize>, DecodeError> {
            if access_unit.is_empty() {
                return Err("empty access unit".into());
            }
            Ok(Some(access_unit.len()))
        }
    }

    fn audio_frame(data: &'static [u8], ts: i64) -> AudioFrame {
        AudioFrame {
            timestamp: ts90k(ts),
            data: Bytes::from_static(data),
            loss: 0,
        }
    }

    #[test]
    fn consume_drains_closed_queue() {
        let output = Arc::new(Queue::unbounded());
        let c = AudioConsumer {
            decoder: FailEmpty,
            output: output.clone(),
            counters: StreamCounters::default(),
        };
        let input = Queue::unbounded();
        input.enqueue(audio_frame(b"abc", 0)).unwrap();
        input.enqueue(audio_frame(b"", 1024)).unwrap();
        input.enqueue(audio_frame(b"de", 2048)).unwrap();
        input.close();
        let counters = consume(c, &input, &AtomicBool::new(false));
        assert_eq!(
            counters,
            StreamCounters {
                decoded: 2,
                dropped: 1
            }
        );
        let out: Vec<(i64, usize)> = drain(&output)
            .iter()
            .map(|s| (s.pts.elapsed(), s.samples))
            .collect();
        assert_eq!(out, [(0, 3), (2048, 2)]);
        assert!(output.is_closed());
    }

    #[test]
    fn consume_honors_stop_flag() {
        let (c, output) = consumer(true);
        let input = Arc::new(Queue::unbounded());
        input.enqueue(nal(&h264_slice(0x65, 7, 0, 0), 0, true, 0)).unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn("test", c, input.clone(), stop.clone()).unwrap();
        while !input.is_empty() {
            std::thread::sleep(Duration::from_millis(5));
        }
        stop.store(true, Ordering::Release);
        let counters = handle.join().unwrap();
        assert!(counters.decoded <= 1);

        // Stopping discards the buffered picture rather than emitting it.
        assert!(output.is_closed() && output.is_empty());
        assert!(!input.is_closed());
    }

    #[tokio::test]
    async fn stop_with_full_blocking_output() {
        init_logging();
        let input = Arc::new(Queue::unbounded());
        for ts in [0, 1024, 2048] {
            input.enqueue(audio_frame(b"abc", ts)).unwrap();
        }
        let output = Arc::new(Queue::new(Some(1), OverflowPolicy::Block));
        let consumer = AudioConsumer {
            decoder: FailEmpty,
            output: output.clone(),
            counters: StreamCounters::default(),
        };
        let stop = Arc::new(AtomicBool::new(false));
        let thread = spawn("audio", consumer, input.clone(), stop.clone()).unwrap();

        // The first frame fills the output; the thread then waits for room
        // to put the second.
        while input.len() > 1 || output.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop.store(true, Ordering::Release);
        let mut stage = Stage {
            input,
            output: output.clone(),
            thread: Some(thread),
        };
        let counters = tokio::time::timeout(Duration::from_secs(3), stage.stop("audio"))
            .await
            .unwrap();
        assert_eq!(
            counters,
            StreamCounters {
                decoded: 2,
                dropped: 1
            }
        );
        assert!(output.is_closed());
        assert_eq!(output.try_dequeue().unwrap().samples, 3);
        assert!(output.try_dequeue().is_none());
    }

    fn video_sdp(rtpmap: &str, fmtp: &str) -> Vec<u8> {
        format!(
            "v=0\r\n\
             o=- 1 1 IN IP4 127.0.0.1\r\n\
             s=Test\r\n\
             t=0 0\r\n\
             m=video 0 RTP/AVP 96\r\n\
             a=rtpmap:96 {rtpmap}\r\n\
             a=fmtp:96 {fmtp}\r\n\
             a=control:trackID=0\r\n"
        )
        .into_bytes()
    }

    /// Serves `sdp` and `packets` (payloads at 90 kHz timestamps, each
    /// marked), then answers until TEARDOWN.
    async fn play(
        sdp: Vec<u8>,
        packets: Vec<(u32, Vec<u8>)>,
    ) -> (Pipeline<Recorder, Discard>, Recorder, tokio::task::JoinHandle<usize>) {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut s = FakeServer::accept(&listener).await;
            s.negotiate_one_track(&sdp).await;
            for (i, (ts, payload)) in packets.iter().enumerate() {
                let seq = u16::try_from(i + 1).unwrap();
                s.data(0, rtp_packet(96, seq, *ts, true, payload)).await;
            }
            s.serve_until_teardown().await
        });
        let mut session = Session::connect(url, SessionOptions::default()).await.unwrap();
        session.describe().await.unwrap();
        session.setup_all().await.unwrap();
        let recorder = Recorder::default();
        let handles = Recorder {
            sets: recorder.sets.clone(),
            units: recorder.units.clone(),
        };
        let pipeline = Pipeline::start(session, Some(recorder), None::<Discard>)
            .await
            .unwrap();
        (pipeline, handles, server)
    }

    #[tokio::test]
    async fn h264_end_to_end() {
        init_logging();
        let sdp = video_sdp(
            "H264/90000",
            &format!("packetization-mode=1;sprop-parameter-sets={H264_SPROP}"),
        );
        let packets = vec![
            (0, h264_slice(0x41, 5, 3, 20)),
            (3000, h264_slice(0x65, 7, 0, 0)),
            (15_000, h264_slice(0x41, 5, 1, 8)),
            (9_000, h264_slice(0x01, 6, 2, 4)),
            (21_000, h264_slice(0x65, 7, 0, 0)),
        ];
        let (pipeline, recorder, server) = play(sdp, packets).await;
        assert!(pipeline.audio_samples().is_none());
        let frames = pipeline.video_frames().unwrap();

        // The second IDR flushes the first GOP in display order.
        let mut got = Vec::new();
        for _ in 0..3 {
            let f = next_item(&frames).await;
            got.push((f.poc, f.payload));
        }
        assert_eq!(got, [(0, 3000), (4, 9_000), (8, 15_000)]);

        let report = pipeline.stop().await;
        assert_eq!(report.network.unwrap().packets, 5);
        assert_eq!(
            report.video,
            StreamCounters {
                decoded: 4,
                dropped: 1
            }
        );
        assert_eq!(report.audio, StreamCounters::default());
        assert!(frames.is_closed());
        server.await.unwrap();

        let (sps, pps) = h264::parse_sprop_parameter_sets(H264_SPROP).unwrap();
        assert_eq!(&*recorder.sets.lock(), &[(None, sps[4..].to_vec(), pps[4..].to_vec())]);
    }

    #[tokio::test]
    async fn h265_end_to_end() {
        init_logging();
        let sdp = video_sdp(
            "H265/90000",
            &format!("sprop-vps={H265_VPS};sprop-sps={H265_SPS};sprop-pps={H265_PPS}"),
        );
        let packets = vec![
            (0, h265_slice(false, 1)),
            (3000, h265_slice(true, 0)),
            (6000, h265_slice(false, 1)),
        ];
        let (pipeline, recorder, server) = play(sdp, packets).await;
        let frames = pipeline.video_frames().unwrap();

        // The SPS allows no reordering, so pictures come out as decoded.
        let mut got = Vec::new();
        for _ in 0..2 {
            let f = next_item(&frames).await;
            got.push((f.poc, f.payload));
        }
        assert_eq!(got, [(0, 3000), (1, 6000)]);

        let report = pipeline.stop().await;
        assert_eq!(report.network.unwrap().packets, 3);
        assert_eq!(
            report.video,
            StreamCounters {
                decoded: 2,
                dropped: 1
            }
        );
        server.await.unwrap();

        let sets = recorder.sets.lock();
        assert_eq!(sets.len(), 1);
        let (vps, sps, pps) = &sets[0];
        assert!(vps.as_ref().unwrap().starts_with(&[0x40, 0x01]));
        assert!(sps.starts_with(&[0x42, 0x01]));
        assert!(pps.starts_with(&[0x44, 0x01]));
    }
}
