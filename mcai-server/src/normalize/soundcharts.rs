//! SoundCharts payloads
//!
//! Single entities arrive wrapped in `{"object": ...}`, collections in
//! `{"items": [...], "page": {...}}`. Nullable numbers are common on
//! freshly-entered chart positions.

use super::{as_record, field, integer, names, path, text, NormalizeError};
use crate::models::{Artist, AudienceSnapshot, Track, TrackArtist};
use chrono::NaiveDate;
use serde_json::Value;

/// One ranking position
#[derive(Debug, Clone, PartialEq)]
pub struct RankingItem {
    pub position: i64,
    pub previous_position: Option<i64>,
    pub position_change: Option<i64>,
    pub weeks_on_chart: Option<i64>,
    pub track_uuid: String,
    pub track_name: Option<String>,
}

/// One page of a chart ranking
#[derive(Debug, Clone, PartialEq)]
pub struct RankingPage {
    pub entries: Vec<RankingItem>,
    /// Offset of the following page, if there is one
    pub next_offset: Option<usize>,
    pub total: Option<usize>,
}

fn items(body: &Value) -> &[Value] {
    match field(body, "items") {
        Some(Value::Array(items)) => items.as_slice(),
        _ => &[],
    }
}

fn object(body: &Value) -> &Value {
    field(body, "object").filter(|o| as_record(o).is_some()).unwrap_or(body)
}

/// Parse a ranking page requested at `offset`
pub fn parse_ranking_page(body: &Value, offset: usize) -> RankingPage {
    let raw = items(body);
    let entries: Vec<RankingItem> = raw.iter().filter_map(parse_ranking_item).collect();
    if entries.len() < raw.len() {
        tracing::debug!(
            skipped = raw.len() - entries.len(),
            "Ranking items without song uuid or position skipped"
        );
    }

    let total = path(body, &["page", "total"])
        .and_then(integer)
        .and_then(|t| usize::try_from(t).ok());
    let consumed = offset + raw.len();
    let has_next_link = path(body, &["page", "next"]).and_then(text).is_some();
    let next_offset = match total {
        _ if raw.is_empty() => None,
        Some(total) => (consumed < total).then_some(consumed),
        None => has_next_link.then_some(consumed),
    };

    RankingPage {
        entries,
        next_offset,
        total,
    }
}

fn parse_ranking_item(item: &Value) -> Option<RankingItem> {
    let song = field(item, "song")?;
    let track_uuid = field(song, "uuid").and_then(text)?;
    let position = field(item, "position").and_then(integer)?;
    let previous_position = field(item, "oldPosition").and_then(integer);

    // Evolution is omitted for new entries; derive it when both ends exist
    let position_change = field(item, "positionEvolution")
        .and_then(integer)
        .or_else(|| previous_position.map(|old| old - position));

    Some(RankingItem {
        position,
        previous_position,
        position_change,
        weeks_on_chart: field(item, "timeOnChart").and_then(integer),
        track_uuid,
        track_name: field(song, "name").and_then(text),
    })
}

/// Flatten genres given as strings or `{root, sub[]}` objects
fn genres(value: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(list)) = value else {
        return Vec::new();
    };

    let mut out: Vec<String> = Vec::new();
    let mut push = |g: String| {
        if !out.iter().any(|existing| existing.eq_ignore_ascii_case(&g)) {
            out.push(g);
        }
    };

    for genre in list {
        match genre {
            Value::Object(_) => {
                if let Some(root) = field(genre, "root").and_then(text) {
                    push(root);
                }
                if let Some(sub) = field(genre, "sub") {
                    names(sub).into_iter().for_each(&mut push);
                }
            }
            other => {
                if let Some(g) = text(other) {
                    push(g);
                }
            }
        }
    }
    out
}

/// ISRC as `{"value": ...}` or a plain string
fn isrc(value: Option<&Value>) -> Option<String> {
    let value = value?;
    if value.is_object() {
        field(value, "value").and_then(text)
    } else {
        text(value)
    }
}

/// Date part of an ISO-8601 timestamp
fn date_part(value: &Value) -> Option<String> {
    let s = text(value)?;
    Some(s.split('T').next().unwrap_or(&s).to_string())
}

/// Parse a song body into a [`Track`]
pub fn parse_song(body: &Value) -> Result<Track, NormalizeError> {
    let song = object(body);
    let track_uuid = field(song, "uuid")
        .and_then(text)
        .ok_or(NormalizeError::MissingRecord("song"))?;

    let artists = match field(song, "artists") {
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(|a| {
                Some(TrackArtist {
                    artist_uuid: field(a, "uuid").and_then(text)?,
                    name: field(a, "name").and_then(text).unwrap_or_default(),
                })
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(Track {
        name: field(song, "name").and_then(text).unwrap_or_default(),
        isrc: isrc(field(song, "isrc")),
        release_date: field(song, "releaseDate").and_then(date_part),
        duration_seconds: field(song, "duration").and_then(integer),
        genres: genres(field(song, "genres")),
        image_url: field(song, "imageUrl").and_then(text),
        artists,
        track_uuid,
    })
}

/// Parse an artist body into an [`Artist`]
pub fn parse_artist(body: &Value) -> Result<Artist, NormalizeError> {
    let artist = object(body);
    let artist_uuid = field(artist, "uuid")
        .and_then(text)
        .ok_or(NormalizeError::MissingRecord("artist"))?;

    Ok(Artist {
        name: field(artist, "name").and_then(text).unwrap_or_default(),
        country_code: field(artist, "countryCode").and_then(text),
        genres: genres(field(artist, "genres")),
        image_url: field(artist, "imageUrl").and_then(text),
        artist_uuid,
    })
}

/// Parse an audience history; items without a usable date are dropped
pub fn parse_audience(body: &Value, artist_uuid: &str, platform: &str) -> Vec<AudienceSnapshot> {
    items(body)
        .iter()
        .filter_map(|item| {
            let day = field(item, "date").and_then(date_part)?;
            let date = NaiveDate::parse_from_str(&day, "%Y-%m-%d").ok()?;
            let follower_count = field(item, "followerCount")
                .or_else(|| field(item, "value"))
                .and_then(integer);
            Some(AudienceSnapshot {
                artist_uuid: artist_uuid.to_string(),
                platform: platform.to_string(),
                date,
                follower_count,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ranking_page_with_nulls() {
        let body = json!({
            "items": [
                {"song": {"uuid": "s1", "name": "One"}, "position": 1, "oldPosition": 3,
                 "positionEvolution": 2, "timeOnChart": 5},
                {"song": {"uuid": "s2", "name": "Two"}, "position": "2", "oldPosition": null,
                 "positionEvolution": null, "timeOnChart": null},
                {"song": {"uuid": "s3"}, "position": 3, "oldPosition": 1},
                {"song": {}, "position": 4}
            ],
            "page": {"offset": 0, "total": 10, "next": "/ranking?offset=4"}
        });

        let page = parse_ranking_page(&body, 0);
        assert_eq!(page.entries.len(), 3);
        assert_eq!(page.entries[0].position_change, Some(2));
        assert_eq!(page.entries[1].position, 2);
        assert_eq!(page.entries[1].previous_position, None);
        assert_eq!(page.entries[1].position_change, None);
        assert_eq!(page.entries[2].position_change, Some(-2));
        assert_eq!(page.entries[2].track_name, None);
        assert_eq!(page.total, Some(10));
        assert_eq!(page.next_offset, Some(4));
    }

    #[test]
    fn test_ranking_last_page() {
        let body = json!({
            "items": [{"song": {"uuid": "s9"}, "position": 9}],
            "page": {"offset": 8, "total": 9, "next": null}
        });
        assert_eq!(parse_ranking_page(&body, 8).next_offset, None);

        let no_total = json!({"items": [{"song": {"uuid": "s1"}, "position": 1}], "page": {"next": "x"}});
        assert_eq!(parse_ranking_page(&no_total, 0).next_offset, Some(1));

        let empty = json!({"items": [], "page": {"total": 50}});
        assert_eq!(parse_ranking_page(&empty, 0).next_offset, None);
    }

    #[test]
    fn test_song_isrc_and_genre_shapes() {
        let body = json!({
            "object": {
                "uuid": "s1",
                "name": "Song",
                "isrc": {"value": "USUM71900001", "countryCode": "US"},
                "releaseDate": "2019-05-17T00:00:00+00:00",
                "duration": 201,
                "genres": [{"root": "Pop", "sub": ["Dance Pop", "pop"]}, "Electronic"],
                "artists": [{"uuid": "a1", "name": "Lead"}, {"name": "No uuid"}]
            }
        });

        let track = parse_song(&body).unwrap();
        assert_eq!(track.isrc.as_deref(), Some("USUM71900001"));
        assert_eq!(track.release_date.as_deref(), Some("2019-05-17"));
        assert_eq!(track.duration_seconds, Some(201));
        assert_eq!(track.genres, vec!["Pop", "Dance Pop", "Electronic"]);
        assert_eq!(track.artists.len(), 1);
        assert_eq!(track.artists[0].artist_uuid, "a1");

        let plain = parse_song(&json!({"object": {"uuid": "s2", "isrc": "GBAYE0000001", "genres": null}})).unwrap();
        assert_eq!(plain.isrc.as_deref(), Some("GBAYE0000001"));
        assert!(plain.genres.is_empty());
    }

    #[test]
    fn test_song_without_uuid_is_error() {
        assert_eq!(
            parse_song(&json!({"object": {"name": "x"}})),
            Err(NormalizeError::MissingRecord("song"))
        );
    }

    #[test]
    fn test_artist() {
        let artist = parse_artist(&json!({
            "object": {"uuid": "a1", "name": "Band", "countryCode": "GB", "genres": ["rock"]}
        }))
        .unwrap();
        assert_eq!(artist.country_code.as_deref(), Some("GB"));
        assert_eq!(artist.genres, vec!["rock"]);
        assert!(parse_artist(&json!({"object": []})).is_err());
    }

    #[test]
    fn test_audience_items() {
        let body = json!({
            "items": [
                {"date": "2024-03-01T00:00:00+00:00", "followerCount": 1200},
                {"date": "2024-03-02", "value": "1300"},
                {"date": "garbage", "followerCount": 1},
                {"followerCount": 5},
                {"date": "2024-03-03T00:00:00+00:00", "followerCount": null}
            ]
        });

        let snapshots = parse_audience(&body, "a1", "spotify");
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].date, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(snapshots[0].follower_count, Some(1200));
        assert_eq!(snapshots[1].follower_count, Some(1300));
        assert_eq!(snapshots[2].follower_count, None);
        assert_eq!(snapshots[2].platform, "spotify");
    }
}
