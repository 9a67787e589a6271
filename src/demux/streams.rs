//! Stream table reconciliation for `subscriptionStart`.
//!
//! The server identifies elementary streams by its own index. Consumers get
//! a local id instead, which survives a rebuild whenever the server reports
//! the same index again. That way a restart of the subscription does not look
//! like a brand new set of tracks downstream.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use crate::message::{Message, Value};

/// Upper bound on tracked streams per subscription.
pub const MAX_STREAMS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Teletext,
}

/// Platform codec description for a server codec name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CodecInfo {
    pub kind: StreamKind,
    pub name: &'static str,
    /// Identifier in the consumer's codec registry.
    pub id: u32,
}

/// Maps server codec names (`H264`, `AAC`, ...) to platform codecs.
pub trait CodecResolver: Send + Sync {
    fn resolve(&self, type_name: &str) -> Option<CodecInfo>;
}

/// Built-in resolver covering the codecs the server commonly announces.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCodecs;

const DEFAULT_CODECS: [(&str, StreamKind); 18] = [
    ("MPEG2VIDEO", StreamKind::Video),
    ("MPEG4VIDEO", StreamKind::Video),
    ("H264", StreamKind::Video),
    ("HEVC", StreamKind::Video),
    ("VP8", StreamKind::Video),
    ("VP9", StreamKind::Video),
    ("THEORA", StreamKind::Video),
    ("MPEG2AUDIO", StreamKind::Audio),
    ("AC3", StreamKind::Audio),
    ("EAC3", StreamKind::Audio),
    ("AAC", StreamKind::Audio),
    ("MP4A", StreamKind::Audio),
    ("VORBIS", StreamKind::Audio),
    ("OPUS", StreamKind::Audio),
    ("FLAC", StreamKind::Audio),
    ("DVBSUB", StreamKind::Subtitle),
    ("TEXTSUB", StreamKind::Subtitle),
    ("TELETEXT", StreamKind::Teletext),
];

static DEFAULT_TABLE: LazyLock<HashMap<&'static str, CodecInfo>> = LazyLock::new(|| {
    DEFAULT_CODECS
        .iter()
        .enumerate()
        .map(|(i, (name, kind))| (*name, CodecInfo { kind: *kind, name, id: i as u32 + 1 }))
        .collect()
});

impl CodecResolver for DefaultCodecs {
    fn resolve(&self, type_name: &str) -> Option<CodecInfo> {
        DEFAULT_TABLE.get(type_name).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioParams {
    pub channels: u32,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub aspect_num: u32,
    pub aspect_den: u32,
    /// Frame duration in microseconds, 0 when unknown.
    pub frame_duration: u32,
}

/// One elementary stream of a subscription.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamDescriptor {
    /// Stable local id; never 0.
    pub id: u32,
    pub server_index: u32,
    pub codec: CodecInfo,
    pub pid: Option<u32>,
    pub language: Option<String>,
    pub audio: Option<AudioParams>,
    pub video: Option<VideoParams>,
    pub composition_id: Option<u32>,
    pub ancillary_id: Option<u32>,
}

impl StreamDescriptor {
    pub fn kind(&self) -> StreamKind {
        self.codec.kind
    }

    fn from_entry(entry: &Message, server_index: u32, codec: CodecInfo) -> Self {
        let audio = (codec.kind == StreamKind::Audio).then(|| AudioParams {
            channels: entry.get_u32("channels").unwrap_or(0),
            sample_rate: entry.get_u32("rate").unwrap_or(0),
        });
        let video = (codec.kind == StreamKind::Video).then(|| VideoParams {
            width: entry.get_u32("width").unwrap_or(0),
            height: entry.get_u32("height").unwrap_or(0),
            aspect_num: entry.get_u32("aspect_num").unwrap_or(0),
            aspect_den: entry.get_u32("aspect_den").unwrap_or(0),
            frame_duration: entry.get_u32("duration").unwrap_or(0),
        });

        Self {
            id: 0,
            server_index,
            codec,
            pid: entry.get_u32("pid"),
            language: entry.get_str("language").filter(|l| !l.is_empty()).map(str::to_string),
            audio,
            video,
            composition_id: entry.get_u32("composition_id"),
            ancillary_id: entry.get_u32("ancillary_id"),
        }
    }
}

/// Active streams of one subscription, in presentation order.
#[derive(Debug, Default)]
pub struct StreamTable {
    streams: Vec<StreamDescriptor>,
    local_ids: HashMap<u32, u32>,
    next_id: u32,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the table from a `subscriptionStart` stream list.
    ///
    /// Entries missing `index`/`type` or naming an unknown codec are skipped.
    /// Returns the new layout.
    pub fn rebuild(
        &mut self,
        entries: &[Value],
        resolver: &dyn CodecResolver,
    ) -> Arc<[StreamDescriptor]> {
        let mut streams: Vec<StreamDescriptor> = Vec::with_capacity(entries.len());
        let mut local_ids = HashMap::with_capacity(entries.len());

        for entry in entries.iter().filter_map(Value::as_map) {
            let (Some(index), Some(type_name)) = (entry.get_u32("index"), entry.get_str("type")) else {
                warn!("Stream entry without index or type");
                continue;
            };
            let Some(codec) = resolver.resolve(type_name) else {
                debug!(index, codec = type_name, "Ignoring stream with unsupported codec");
                continue;
            };
            if local_ids.contains_key(&index) {
                warn!(index, "Duplicate stream index");
                continue;
            }
            if streams.len() >= MAX_STREAMS {
                warn!(index, codec = type_name, max = MAX_STREAMS, "Too many streams, ignoring");
                continue;
            }

            let id = match self.local_ids.get(&index) {
                Some(id) => *id,
                None => {
                    self.next_id += 1;
                    self.next_id
                }
            };
            let mut descriptor = StreamDescriptor::from_entry(entry, index, codec);
            descriptor.id = id;
            local_ids.insert(index, id);
            streams.push(descriptor);
        }

        if let Some(pos) = streams.iter().position(|s| s.kind() == StreamKind::Video) {
            let video = streams.remove(pos);
            streams.insert(0, video);
        }

        debug!(count = streams.len(), "Stream table rebuilt");
        self.streams = streams;
        self.local_ids = local_ids;
        self.snapshot()
    }

    pub fn local_id(&self, server_index: u32) -> Option<u32> {
        self.local_ids.get(&server_index).copied()
    }

    pub fn snapshot(&self) -> Arc<[StreamDescriptor]> {
        self.streams.clone().into()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Drop all streams; local ids already handed out are not reused.
    pub fn clear(&mut self) {
        self.streams.clear();
        self.local_ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u32, codec: &str) -> Value {
        Message::new().with("index", index).with("type", codec).into()
    }

    fn codecs(table: &[StreamDescriptor]) -> Vec<&str> {
        table.iter().map(|s| s.codec.name).collect()
    }

    #[test]
    fn video_goes_to_slot_zero() {
        let mut table = StreamTable::new();
        let layout = table.rebuild(&[entry(1, "H264"), entry(2, "AAC"), entry(3, "DVBSUB")], &DefaultCodecs);
        assert_eq!(codecs(&layout), ["H264", "AAC", "DVBSUB"]);

        let mut table = StreamTable::new();
        let layout = table.rebuild(&[entry(2, "AAC"), entry(3, "DVBSUB"), entry(1, "H264")], &DefaultCodecs);
        assert_eq!(codecs(&layout), ["H264", "AAC", "DVBSUB"]);
        assert_eq!(layout[0].kind(), StreamKind::Video);
    }

    #[test]
    fn ids_survive_rebuild_for_same_server_index() {
        let mut table = StreamTable::new();
        let first = table.rebuild(&[entry(10, "H264"), entry(11, "AAC")], &DefaultCodecs);
        let second = table.rebuild(&[entry(11, "AAC"), entry(12, "AC3"), entry(10, "H264")], &DefaultCodecs);

        assert_eq!(table.local_id(10), Some(first[0].id));
        assert_eq!(table.local_id(11), Some(first[1].id));
        let ac3 = second.iter().find(|s| s.server_index == 12).unwrap();
        assert!(first.iter().all(|s| s.id != ac3.id));
    }

    #[test]
    fn streams_no_longer_reported_are_dropped() {
        let mut table = StreamTable::new();
        table.rebuild(&[entry(1, "H264"), entry(2, "AAC")], &DefaultCodecs);
        table.rebuild(&[entry(1, "H264")], &DefaultCodecs);
        assert_eq!(table.local_id(2), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn overflow_and_unknown_codecs_are_ignored() {
        let mut entries: Vec<Value> = (0..30).map(|i| entry(i, "AAC")).collect();
        entries.push(entry(99, "SOMETHINGNEW"));
        let mut table = StreamTable::new();
        let layout = table.rebuild(&entries, &DefaultCodecs);
        assert_eq!(layout.len(), MAX_STREAMS);
        assert_eq!(table.local_id(99), None);
    }

    #[test]
    fn parses_stream_parameters() {
        let video: Value = Message::new()
            .with("index", 1u32)
            .with("type", "HEVC")
            .with("width", 1920u32)
            .with("height", 1080u32)
            .with("duration", 40_000u32)
            .into();
        let audio: Value = Message::new()
            .with("index", 2u32)
            .with("type", "AC3")
            .with("language", "deu")
            .with("channels", 6u32)
            .with("rate", 48_000u32)
            .into();
        let mut table = StreamTable::new();
        let layout = table.rebuild(&[video, audio], &DefaultCodecs);

        assert_eq!(layout[0].video.map(|v| (v.width, v.height, v.frame_duration)), Some((1920, 1080, 40_000)));
        assert_eq!(layout[1].language.as_deref(), Some("deu"));
        assert_eq!(layout[1].audio, Some(AudioParams { channels: 6, sample_rate: 48_000 }));
        assert!(layout[1].video.is_none());
    }
}
