//! Track registry
//!
//! Assigns stable track ids in first-seen order and caches each track's
//! codec private data. Tracks are never removed while a session is active.

use bytes::Bytes;

use crate::error::{Result, SinkError};
use crate::pipeline::types::{MediaKind, MediaType};

/// One registered media track
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub track_id: u64,
    pub kind: MediaKind,
    codec_private_data: Option<Bytes>,
}

impl TrackInfo {
    pub fn codec_private_data(&self) -> Option<&Bytes> {
        self.codec_private_data.as_ref()
    }
}

/// Outcome of storing codec private data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecDataUpdate {
    /// First value observed for the track
    Stored,
    /// The same value was already stored
    Unchanged,
}

#[derive(Debug, Default)]
pub struct TrackRegistry {
    tracks: Vec<TrackInfo>,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self { tracks: Vec::new() }
    }

    /// Register a track and return its id. Ids start at 1.
    ///
    /// A session carries at most one video and one audio track.
    pub fn register(&mut self, kind: MediaKind) -> Result<u64> {
        if self.tracks.iter().any(|t| t.kind == kind) {
            return Err(SinkError::TrackLimit(kind.as_str()));
        }
        let track_id = self.tracks.len() as u64 + 1;
        self.tracks.push(TrackInfo {
            track_id,
            kind,
            codec_private_data: None,
        });
        Ok(track_id)
    }

    /// Store the codec private data of a track, idempotent for identical bytes
    pub fn set_codec_private_data(&mut self, track_id: u64, data: Bytes) -> Result<CodecDataUpdate> {
        let track = self
            .tracks
            .iter_mut()
            .find(|t| t.track_id == track_id)
            .ok_or(SinkError::UnknownTrack(track_id))?;

        match &track.codec_private_data {
            Some(existing) if *existing == data => Ok(CodecDataUpdate::Unchanged),
            Some(_) => Err(SinkError::DuplicateCodecData { track_id }),
            None => {
                track.codec_private_data = Some(data);
                Ok(CodecDataUpdate::Stored)
            }
        }
    }

    pub fn codec_private_data(&self, track_id: u64) -> Result<Bytes> {
        self.get(track_id)
            .and_then(|t| t.codec_private_data.clone())
            .ok_or(SinkError::UnknownTrack(track_id))
    }

    pub fn get(&self, track_id: u64) -> Option<&TrackInfo> {
        self.tracks.iter().find(|t| t.track_id == track_id)
    }

    /// Tracks in registration order
    pub fn tracks(&self) -> &[TrackInfo] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Media type implied by the registered tracks
    pub fn media_type(&self) -> Option<MediaType> {
        let video = self.tracks.iter().filter(|t| t.kind == MediaKind::Video).count();
        let audio = self.tracks.len() - video;
        MediaType::from_track_counts(video, audio)
    }

    /// `(track_id, codec private data)` for every track that has it
    pub fn codec_data_snapshot(&self) -> Vec<(u64, Bytes)> {
        self.tracks
            .iter()
            .filter_map(|t| t.codec_private_data.clone().map(|cpd| (t.track_id, cpd)))
            .collect()
    }
}
