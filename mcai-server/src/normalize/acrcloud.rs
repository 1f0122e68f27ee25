//! ACRCloud file-scanning payloads
//!
//! Three shapes cross the boundary: the upload response (carries the file
//! id), the callback notice, and the full file result fetched afterwards.

use super::{as_record, field, integer, names, number, path, text, NormalizeError};
use crate::models::{MatchKind, TrackMatch};
use serde_json::Value;

/// Processing status reported by a callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackStatus {
    Processing,
    Ready,
    /// Processed, nothing recognized; fetched like a ready result
    NoResult,
    Failed(String),
}

/// Canonical callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackNotice {
    pub external_file_id: String,
    pub status: CallbackStatus,
}

impl CallbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackStatus::Processing => "processing",
            CallbackStatus::Ready => "ready",
            CallbackStatus::NoResult => "no_result",
            CallbackStatus::Failed(_) => "failed",
        }
    }
}

/// File id from an upload response (`data.id`, `id`, or `data.file_id`)
pub fn extract_file_id(response: &Value) -> Option<String> {
    path(response, &["data", "id"])
        .or_else(|| path(response, &["data", "file_id"]))
        .or_else(|| field(response, "id"))
        .or_else(|| field(response, "file_id"))
        .and_then(text)
}

/// Reduce a callback body to a [`CallbackNotice`]
pub fn parse_callback(payload: &Value) -> Result<CallbackNotice, NormalizeError> {
    let external_file_id = field(payload, "file_id")
        .or_else(|| field(payload, "id"))
        .or_else(|| path(payload, &["data", "file_id"]))
        .or_else(|| path(payload, &["data", "id"]))
        .and_then(text)
        .ok_or(NormalizeError::MissingFileId)?;

    let state = field(payload, "state").or_else(|| path(payload, &["data", "state"]));
    let message = ["error", "message", "msg"]
        .iter()
        .find_map(|key| field(payload, key).and_then(text));

    Ok(CallbackNotice {
        external_file_id,
        status: status_from(state, message),
    })
}

fn status_from(state: Option<&Value>, message: Option<String>) -> CallbackStatus {
    let Some(state) = state else {
        // Callbacks are sent on completion; a bare notice means ready
        return CallbackStatus::Ready;
    };

    if let Some(code) = integer(state) {
        return match code {
            1 => CallbackStatus::Ready,
            0 => CallbackStatus::Processing,
            -1 => CallbackStatus::NoResult,
            c if c < -1 => CallbackStatus::Failed(message.unwrap_or_else(|| {
                format!("fingerprinting service reported state {}", c)
            })),
            c => {
                tracing::warn!(state = c, "Unknown callback state, treating as processing");
                CallbackStatus::Processing
            }
        };
    }

    match text(state).map(|s| s.to_ascii_lowercase()).as_deref() {
        Some("ready" | "done" | "finished" | "success") => CallbackStatus::Ready,
        Some("no_result" | "no result" | "noresult") => CallbackStatus::NoResult,
        Some("error" | "failed" | "failure") => CallbackStatus::Failed(
            message.unwrap_or_else(|| "fingerprinting service reported an error".to_string()),
        ),
        _ => CallbackStatus::Processing,
    }
}

/// Extract every recognized track from a file result
///
/// `data` may be an object or a one-element list; a missing or empty
/// `results` means nothing was recognized.
pub fn parse_file_result(body: &Value) -> Result<Vec<TrackMatch>, NormalizeError> {
    let record = match field(body, "data") {
        Some(data) => data,
        None if as_record(body).is_some_and(|r| r.contains_key("results")) => body,
        None => return Err(NormalizeError::MissingRecord("file")),
    };
    if as_record(record).is_none() {
        return Err(NormalizeError::MissingRecord("file"));
    }

    let Some(results) = field(record, "results") else {
        return Ok(Vec::new());
    };

    let mut matches = Vec::new();
    for (key, kind) in [("music", MatchKind::Music), ("cover_songs", MatchKind::Cover)] {
        if let Some(Value::Array(items)) = field(results, key) {
            matches.extend(items.iter().filter_map(|item| parse_match(item, kind)));
        }
    }

    Ok(matches)
}

fn parse_match(item: &Value, kind: MatchKind) -> Option<TrackMatch> {
    as_record(item)?;
    let inner = field(item, "result").filter(|r| as_record(r).is_some()).unwrap_or(item);

    let title = field(inner, "title").and_then(text);
    let acrid = field(inner, "acrid").and_then(text);
    if title.is_none() && acrid.is_none() {
        return None;
    }

    let album = field(inner, "album").and_then(|album| match album {
        Value::String(_) => text(album),
        other => field(other, "name").and_then(text),
    });

    let isrc = path(inner, &["external_ids", "isrc"])
        .or_else(|| field(inner, "isrc"))
        .and_then(text);

    let seconds = |key: &str| field(item, key).or_else(|| field(inner, key)).and_then(number);

    Some(TrackMatch {
        kind,
        title,
        artists: field(inner, "artists").map(names).unwrap_or_default(),
        album,
        isrc,
        score: score_of(item, inner),
        offset_seconds: seconds("offset"),
        played_duration_seconds: seconds("played_duration"),
        acrid,
        spotify_track_id: path(inner, &["external_metadata", "spotify", "track", "id"])
            .and_then(text),
        deezer_track_id: path(inner, &["external_metadata", "deezer", "track", "id"])
            .and_then(text),
        youtube_video_id: path(inner, &["external_metadata", "youtube", "vid"]).and_then(text),
    })
}

/// Score on a 0-100 scale; `similarity` is reported as 0-1
fn score_of(item: &Value, inner: &Value) -> f64 {
    let score = field(inner, "score")
        .or_else(|| field(item, "score"))
        .and_then(number)
        .or_else(|| {
            field(inner, "similarity")
                .or_else(|| field(item, "similarity"))
                .and_then(number)
                .map(|s| s * 100.0)
        })
        .unwrap_or(0.0);

    score.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_file_id_shapes() {
        assert_eq!(extract_file_id(&json!({"data": {"id": "f1"}})).as_deref(), Some("f1"));
        assert_eq!(extract_file_id(&json!({"data": [{"id": "f2"}]})).as_deref(), Some("f2"));
        assert_eq!(extract_file_id(&json!({"id": 77})).as_deref(), Some("77"));
        assert_eq!(extract_file_id(&json!({"data": []})), None);
    }

    #[test]
    fn test_callback_states() {
        let cases = [
            (json!({"file_id": "a", "state": 1}), CallbackStatus::Ready),
            (json!({"file_id": "a", "state": "0"}), CallbackStatus::Processing),
            (json!({"file_id": "a", "state": -1}), CallbackStatus::NoResult),
            (json!({"file_id": "a"}), CallbackStatus::Ready),
            (json!({"file_id": "a", "state": "ready"}), CallbackStatus::Ready),
        ];
        for (payload, expected) in cases {
            assert_eq!(parse_callback(&payload).unwrap().status, expected, "{}", payload);
        }
    }

    #[test]
    fn test_callback_failure_carries_message() {
        let notice =
            parse_callback(&json!({"id": "b", "state": -3, "error": "decode failed"})).unwrap();
        assert_eq!(notice.external_file_id, "b");
        assert_eq!(notice.status, CallbackStatus::Failed("decode failed".to_string()));
    }

    #[test]
    fn test_callback_nested_data() {
        let notice = parse_callback(&json!({"cid": 9, "data": [{"id": "c", "state": 1}]})).unwrap();
        assert_eq!(notice.external_file_id, "c");
        assert_eq!(notice.status, CallbackStatus::Ready);
    }

    #[test]
    fn test_callback_without_id_is_error() {
        assert_eq!(
            parse_callback(&json!({"state": 1})),
            Err(NormalizeError::MissingFileId)
        );
    }

    #[test]
    fn test_file_result_full_shape() {
        let body = json!({
            "data": [{
                "id": "f1",
                "state": 1,
                "results": {
                    "music": [{
                        "result": {
                            "title": "Song A",
                            "artists": [{"name": "Artist A"}, {"name": "Feat B"}],
                            "album": {"name": "Album A"},
                            "acrid": "acr-1",
                            "score": 100,
                            "external_ids": {"isrc": "USX9P1234567"},
                            "external_metadata": {
                                "spotify": {"track": {"id": "sp-1"}},
                                "deezer": [],
                                "youtube": {"vid": "yt-1"}
                            }
                        },
                        "offset": 12,
                        "played_duration": 30
                    }],
                    "cover_songs": [{
                        "result": {
                            "title": "Song B",
                            "artists": ["Cover Artist"],
                            "album": [],
                            "external_ids": [],
                            "external_metadata": [],
                            "similarity": "0.82"
                        }
                    }]
                }
            }]
        });

        let matches = parse_file_result(&body).unwrap();
        assert_eq!(matches.len(), 2);

        let music = &matches[0];
        assert_eq!(music.kind, MatchKind::Music);
        assert_eq!(music.title.as_deref(), Some("Song A"));
        assert_eq!(music.artists, vec!["Artist A", "Feat B"]);
        assert_eq!(music.album.as_deref(), Some("Album A"));
        assert_eq!(music.isrc.as_deref(), Some("USX9P1234567"));
        assert_eq!(music.score, 100.0);
        assert_eq!(music.offset_seconds, Some(12.0));
        assert_eq!(music.spotify_track_id.as_deref(), Some("sp-1"));
        assert_eq!(music.deezer_track_id, None);
        assert_eq!(music.youtube_video_id.as_deref(), Some("yt-1"));

        let cover = &matches[1];
        assert_eq!(cover.kind, MatchKind::Cover);
        assert_eq!(cover.album, None);
        assert_eq!(cover.isrc, None);
        assert!((cover.score - 82.0).abs() < 1e-9);
    }

    #[test]
    fn test_file_result_flat_match_and_isrc_list() {
        let body = json!({
            "data": {
                "results": {
                    "music": [{
                        "title": "Flat",
                        "artists": "Solo",
                        "album": "Single",
                        "isrc": ["", "GBAYE0000001"],
                        "score": "91"
                    }]
                }
            }
        });

        let matches = parse_file_result(&body).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].artists, vec!["Solo"]);
        assert_eq!(matches[0].album.as_deref(), Some("Single"));
        assert_eq!(matches[0].isrc.as_deref(), Some("GBAYE0000001"));
        assert_eq!(matches[0].score, 91.0);
    }

    #[test]
    fn test_file_result_empty_results_shapes() {
        for body in [
            json!({"data": {"id": "f", "results": null}}),
            json!({"data": {"id": "f", "results": []}}),
            json!({"data": {"id": "f", "results": {"music": [], "cover_songs": []}}}),
            json!({"data": [{"id": "f", "state": -1}]}),
        ] {
            assert!(parse_file_result(&body).unwrap().is_empty(), "{}", body);
        }
    }

    #[test]
    fn test_file_result_without_record_is_error() {
        assert_eq!(
            parse_file_result(&json!({"data": []})),
            Err(NormalizeError::MissingRecord("file"))
        );
        assert_eq!(
            parse_file_result(&json!({"status": "ok"})),
            Err(NormalizeError::MissingRecord("file"))
        );
    }

    #[test]
    fn test_unrecognizable_items_skipped() {
        let body = json!({"data": {"results": {"music": ["junk", {"result": {}}, {"title": "Kept"}]}}});
        let matches = parse_file_result(&body).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].title.as_deref(), Some("Kept"));
        assert_eq!(matches[0].score, 0.0);
    }
}
