//! Decides whether a remote stream is a camera feed or a screen share.
//!
//! The transport carries no role field, so the decision is an ordered list of
//! rules; the first rule that has an opinion wins:
//!
//! 1. a pending "screen share started" signal from the sender (consumed)
//! 2. a role the sender declared on the track itself
//! 3. a surface hint other than `none`
//! 4. video without any audio
//! 5. a screen-ish video label
//! 6. a video resolution at or above the screen threshold
//! 7. otherwise camera
//!
//! Rule 4 only holds once every track of a renegotiation burst has arrived,
//! so tracks are buffered for a short window before they are classified.
//! It also labels a muted or audio-denied camera as a screen; that ambiguity
//! is left as is.

use derive_more::Display;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use tokio::time::Instant;

use crate::config::Config;
use crate::internal::data_types::{
    RemoteTrack, StreamId, StreamRole, SurfaceHint, TrackDescriptor,
};

lazy_static! {
    static ref SCREEN_LABEL: Regex =
        Regex::new(r"(?i)screen|display|window|monitor|sharing").expect("valid label pattern");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ClassificationRule {
    #[display(fmt = "pending screen signal")]
    PendingSignal,
    #[display(fmt = "declared role")]
    DeclaredRole,
    #[display(fmt = "surface hint")]
    SurfaceHint,
    #[display(fmt = "no audio")]
    NoAudio,
    #[display(fmt = "label keyword")]
    LabelKeyword,
    #[display(fmt = "high resolution")]
    HighResolution,
    #[display(fmt = "fallback")]
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub role: StreamRole,
    pub rule: ClassificationRule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub min_width: u32,
    pub min_height: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_width: 1280,
            min_height: 720,
        }
    }
}

impl From<&Config> for Thresholds {
    fn from(config: &Config) -> Self {
        Self {
            min_width: config.screen_min_width,
            min_height: config.screen_min_height,
        }
    }
}

struct Evidence<'a> {
    tracks: &'a [TrackDescriptor],
    pending_signal: bool,
    thresholds: Thresholds,
}

impl Evidence<'_> {
    fn first_video(&self) -> Option<&TrackDescriptor> {
        self.tracks.iter().find(|t| t.is_video())
    }
}

type Rule = fn(&Evidence) -> Option<StreamRole>;

const RULES: [(ClassificationRule, Rule); 6] = [
    (ClassificationRule::PendingSignal, pending_signal),
    (ClassificationRule::DeclaredRole, declared_role),
    (ClassificationRule::SurfaceHint, surface_hint),
    (ClassificationRule::NoAudio, no_audio),
    (ClassificationRule::LabelKeyword, label_keyword),
    (ClassificationRule::HighResolution, high_resolution),
];

fn pending_signal(ev: &Evidence) -> Option<StreamRole> {
    // audio-only streams never take the signal
    (ev.pending_signal && ev.first_video().is_some()).then_some(StreamRole::Screen)
}

fn declared_role(ev: &Evidence) -> Option<StreamRole> {
    ev.tracks.iter().find_map(|t| t.declared_role)
}

fn surface_hint(ev: &Evidence) -> Option<StreamRole> {
    ev.tracks
        .iter()
        .any(|t| matches!(t.surface, Some(s) if s != SurfaceHint::Unspecified))
        .then_some(StreamRole::Screen)
}

fn no_audio(ev: &Evidence) -> Option<StreamRole> {
    let has_audio = ev.tracks.iter().any(|t| t.is_audio());
    (!has_audio && ev.first_video().is_some()).then_some(StreamRole::Screen)
}

fn label_keyword(ev: &Evidence) -> Option<StreamRole> {
    ev.first_video()
        .filter(|t| SCREEN_LABEL.is_match(&t.label))
        .map(|_| StreamRole::Screen)
}

fn high_resolution(ev: &Evidence) -> Option<StreamRole> {
    let video = ev.first_video()?;
    let wide = video.width.map_or(false, |w| w >= ev.thresholds.min_width);
    let tall = video.height.map_or(false, |h| h >= ev.thresholds.min_height);
    (wide || tall).then_some(StreamRole::Screen)
}

/// Runs the rule list over one stream's tracks.
pub fn classify(
    tracks: &[TrackDescriptor],
    pending_signal: bool,
    thresholds: Thresholds,
) -> Classification {
    let evidence = Evidence {
        tracks,
        pending_signal,
        thresholds,
    };
    RULES
        .iter()
        .find_map(|(rule, check)| {
            check(&evidence).map(|role| Classification { role, rule: *rule })
        })
        .unwrap_or(Classification {
            role: StreamRole::Camera,
            rule: ClassificationRule::Fallback,
        })
}

/// Tracks of one remote stream waiting in the debounce buffer.
#[derive(Debug, Clone)]
pub struct IncomingStreamRecord<M> {
    pub stream_id: StreamId,
    pub tracks: Vec<(TrackDescriptor, M)>,
    pub arrival: Instant,
}

/// A labelled stream, ready for rendering or recording.
#[derive(Debug, Clone)]
pub struct ClassifiedStream<M> {
    pub stream_id: StreamId,
    pub role: StreamRole,
    pub rule: ClassificationRule,
    pub tracks: Vec<(TrackDescriptor, M)>,
}

impl<M> ClassifiedStream<M> {
    pub fn descriptors(&self) -> impl Iterator<Item = &TrackDescriptor> {
        self.tracks.iter().map(|(d, _)| d)
    }
}

/// Per-sender classifier state: the pending out-of-band signal, the debounce
/// buffer and the streams currently handed out.
pub struct StreamClassifier<M> {
    thresholds: Thresholds,
    pending_screen_signal: bool,
    buffer: Vec<IncomingStreamRecord<M>>,
    active: HashMap<StreamId, ClassifiedStream<M>>,
}

impl<M: Clone> StreamClassifier<M> {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            pending_screen_signal: false,
            buffer: Vec::new(),
            active: HashMap::new(),
        }
    }

    pub fn screen_signal_pending(&self) -> bool {
        self.pending_screen_signal
    }

    /// the sender announced a screen share
    pub fn screen_share_started(&mut self) {
        self.pending_screen_signal = true;
    }

    /// the sender stopped sharing: drops a pending signal and retires the
    /// sender's screen streams
    pub fn screen_share_stopped(&mut self) -> Vec<ClassifiedStream<M>> {
        self.pending_screen_signal = false;
        let screens: Vec<StreamId> = self
            .active
            .values()
            .filter(|s| s.role == StreamRole::Screen)
            .map(|s| s.stream_id.clone())
            .collect();
        screens
            .iter()
            .filter_map(|id| self.active.remove(id))
            .collect()
    }

    /// Buffers an arriving track. Returns true when the buffer was empty,
    /// i.e. the caller has to start the debounce timer.
    pub fn ingest(&mut self, track: RemoteTrack<M>, now: Instant) -> bool {
        let was_empty = self.buffer.is_empty();
        let RemoteTrack {
            stream_id,
            descriptor,
            media,
        } = track;

        match self.buffer.iter_mut().find(|r| r.stream_id == stream_id) {
            Some(record) => {
                record.tracks.retain(|(d, _)| d.id != descriptor.id);
                record.tracks.push((descriptor, media));
            }
            None => self.buffer.push(IncomingStreamRecord {
                stream_id,
                tracks: vec![(descriptor, media)],
                arrival: now,
            }),
        }
        was_empty
    }

    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Classifies everything in the buffer, in arrival order.
    pub fn flush(&mut self) -> Vec<ClassifiedStream<M>> {
        let now = Instant::now();
        let mut out = Vec::new();

        for record in std::mem::take(&mut self.buffer) {
            // late tracks of a stream already handed out keep its role
            if let Some(existing) = self.active.get_mut(&record.stream_id) {
                for (descriptor, media) in record.tracks {
                    existing.tracks.retain(|(d, _)| d.id != descriptor.id);
                    existing.tracks.push((descriptor, media));
                }
                log::debug!(
                    "stream {} gained tracks, stays {}",
                    existing.stream_id,
                    existing.role
                );
                out.push(existing.clone());
                continue;
            }

            let descriptors: Vec<TrackDescriptor> =
                record.tracks.iter().map(|(d, _)| d.clone()).collect();
            let decision = classify(&descriptors, self.pending_screen_signal, self.thresholds);
            if decision.rule == ClassificationRule::PendingSignal {
                self.pending_screen_signal = false;
            }
            log::info!(
                "stream {} classified as {} by {} after {:?}",
                record.stream_id,
                decision.role,
                decision.rule,
                now.saturating_duration_since(record.arrival)
            );

            let stream = ClassifiedStream {
                stream_id: record.stream_id,
                role: decision.role,
                rule: decision.rule,
                tracks: record.tracks,
            };
            self.active.insert(stream.stream_id.clone(), stream.clone());
            out.push(stream);
        }
        out
    }

    /// A remote track ended. Returns the stream if that retired it: its video
    /// ended or nothing is left in it.
    pub fn track_ended(&mut self, stream_id: &str, track_id: &str) -> Option<ClassifiedStream<M>> {
        if let Some(pos) = self.buffer.iter().position(|r| r.stream_id == stream_id) {
            self.buffer[pos].tracks.retain(|(d, _)| d.id != track_id);
            if self.buffer[pos].tracks.is_empty() {
                self.buffer.remove(pos);
            }
        }

        let stream = self.active.get_mut(stream_id)?;
        let ended_video = stream
            .tracks
            .iter()
            .any(|(d, _)| d.id == track_id && d.is_video());
        stream.tracks.retain(|(d, _)| d.id != track_id);

        if ended_video || stream.tracks.is_empty() {
            let retired = self.active.remove(stream_id);
            if let Some(s) = &retired {
                log::info!("{} stream {} retired", s.role, s.stream_id);
            }
            retired
        } else {
            None
        }
    }

    pub fn active(&self) -> impl Iterator<Item = &ClassifiedStream<M>> {
        self.active.values()
    }

    /// forgets everything, used on teardown
    pub fn clear(&mut self) {
        self.pending_screen_signal = false;
        self.buffer.clear();
        self.active.clear();
    }
}
