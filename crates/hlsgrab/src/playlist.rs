// HLS playlist model: a line-scanning parser, the kind classifier, and the variant /
// rendition selectors that operate on master playlists.

use media_types::Resolution;
use tracing::{debug, trace};
use url::Url;

use crate::error::{HlsError, Result};

const TAG_STREAM_INF: &str = "#EXT-X-STREAM-INF";
const TAG_EXTINF: &str = "#EXTINF";
const TAG_KEY: &str = "#EXT-X-KEY";
const TAG_MEDIA: &str = "#EXT-X-MEDIA";
const TAG_MEDIA_SEQUENCE: &str = "#EXT-X-MEDIA-SEQUENCE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    MasterPlain,
    MasterEncrypted,
    /// Plain media playlist without any segment line to inspect.
    MediaPlain,
    MediaEncrypted,
    MediaSegmentsTs,
    MediaSegmentsM4s,
    /// Mixed or missing segment extensions; no single container can be assumed.
    MediaSegmentsMixed,
    Unknown,
}

impl PlaylistKind {
    pub fn is_master(self) -> bool {
        matches!(self, Self::MasterPlain | Self::MasterEncrypted)
    }

    pub fn is_media(self) -> bool {
        matches!(
            self,
            Self::MediaPlain
                | Self::MediaEncrypted
                | Self::MediaSegmentsTs
                | Self::MediaSegmentsM4s
                | Self::MediaSegmentsMixed
        )
    }

    pub fn is_encrypted(self) -> bool {
        matches!(self, Self::MasterEncrypted | Self::MediaEncrypted)
    }
}

impl std::fmt::Display for PlaylistKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::MasterPlain => "master",
            Self::MasterEncrypted => "master (encrypted)",
            Self::MediaPlain => "media",
            Self::MediaEncrypted => "media (encrypted)",
            Self::MediaSegmentsTs => "media (.ts segments)",
            Self::MediaSegmentsM4s => "media (.m4s segments)",
            Self::MediaSegmentsMixed => "media (mixed segments)",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Extension observed on a segment URL path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentExtension {
    Ts,
    M4s,
    Unknown,
}

impl SegmentExtension {
    pub fn from_url(url: &str) -> Self {
        // Query and fragment never carry the container extension.
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let path = path.to_ascii_lowercase();
        if path.ends_with(".ts") {
            Self::Ts
        } else if path.ends_with(".m4s") {
            Self::M4s
        } else {
            Self::Unknown
        }
    }
}

/// Container used for temporary segment files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContainerHint {
    #[default]
    Ts,
    M4s,
}

impl ContainerHint {
    /// File extension including the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Ts => ".ts",
            Self::M4s => ".m4s",
        }
    }
}

/// Which variant of a master playlist to follow, ranked by pixel count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum VariantChoice {
    #[default]
    Highest,
    /// Median of the ranked variants, rounding towards the lower half.
    Middle,
    Lowest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub resolution: Option<Resolution>,
    pub url: String,
    pub bandwidth: Option<u64>,
    pub codecs: Option<String>,
    pub audio_group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendition {
    pub media_type: String,
    pub group_id: Option<String>,
    pub name: Option<String>,
    pub uri: Option<String>,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRef {
    /// Position in the playlist; defines the output order.
    pub index: usize,
    pub url: String,
    pub extension: SegmentExtension,
}

/// A parsed `#EXT-X-KEY` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDirective {
    pub method: String,
    pub uri: Option<String>,
    /// IV exactly as written, `0x` prefix included when present.
    pub iv: Option<String>,
}

/// A classified playlist. Built only through [`Playlist::parse`], so the derived
/// attributes always match the text.
#[derive(Debug, Clone)]
pub struct Playlist {
    text: String,
    kind: PlaylistKind,
    variants: Vec<Variant>,
    renditions: Vec<Rendition>,
    segments: Vec<SegmentRef>,
    keys: Vec<KeyDirective>,
    media_sequence: u64,
}

impl Playlist {
    pub fn parse(text: impl Into<String>) -> Self {
        let text = text.into();
        let scanned = scan(&text);
        let kind = classify_scanned(&text, &scanned);
        debug!(
            %kind,
            variants = scanned.variants.len(),
            segments = scanned.segments.len(),
            "playlist parsed"
        );
        Self {
            kind,
            variants: scanned.variants,
            renditions: scanned.renditions,
            segments: scanned.segments,
            keys: scanned.keys,
            media_sequence: scanned.media_sequence,
            text,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn kind(&self) -> PlaylistKind {
        self.kind
    }

    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    pub fn renditions(&self) -> &[Rendition] {
        &self.renditions
    }

    pub fn segments(&self) -> &[SegmentRef] {
        &self.segments
    }

    pub fn keys(&self) -> &[KeyDirective] {
        &self.keys
    }

    /// Value of `#EXT-X-MEDIA-SEQUENCE`, zero when absent.
    pub fn media_sequence(&self) -> u64 {
        self.media_sequence
    }

    /// `.m4s` only when every segment is fragmented MP4, `.ts` otherwise.
    pub fn container_hint(&self) -> ContainerHint {
        if !self.segments.is_empty()
            && self
                .segments
                .iter()
                .all(|s| s.extension == SegmentExtension::M4s)
        {
            ContainerHint::M4s
        } else {
            ContainerHint::Ts
        }
    }

    /// Variant with the largest pixel count; ties go to the first listed.
    pub fn highest_resolution_variant(&self) -> Option<(Resolution, &Variant)> {
        self.select_variant(VariantChoice::Highest)
    }

    /// Variant picked by `choice` among those tagged with a resolution.
    ///
    /// Variants sharing a pixel count rank equal and the first listed wins.
    pub fn select_variant(&self, choice: VariantChoice) -> Option<(Resolution, &Variant)> {
        let mut ranked: Vec<(Resolution, &Variant)> = self
            .variants
            .iter()
            .filter_map(|v| v.resolution.map(|r| (r, v)))
            .collect();
        if ranked.is_empty() {
            return None;
        }
        // Stable, so equal pixel counts keep playlist order.
        ranked.sort_by_key(|(resolution, _)| resolution.pixels());

        let position = match choice {
            VariantChoice::Lowest => 0,
            VariantChoice::Middle => (ranked.len() - 1) / 2,
            VariantChoice::Highest => ranked.len() - 1,
        };
        let target = ranked[position].0.pixels();
        ranked.into_iter().find(|(r, _)| r.pixels() == target)
    }

    /// First audio rendition that carries a URI.
    pub fn audio_rendition(&self) -> Option<&Rendition> {
        self.renditions
            .iter()
            .find(|r| r.media_type.eq_ignore_ascii_case("AUDIO") && r.uri.is_some())
    }
}

/// Classify playlist text from its markers.
///
/// A variant marker wins over a duration marker. Plain media playlists are further
/// split by the extension of their segment URLs.
pub fn classify(text: &str) -> PlaylistKind {
    classify_scanned(text, &scan(text))
}

fn classify_scanned(text: &str, scanned: &Scanned) -> PlaylistKind {
    let encrypted = text.contains(TAG_KEY);

    if text.contains(TAG_STREAM_INF) {
        return if encrypted {
            PlaylistKind::MasterEncrypted
        } else {
            PlaylistKind::MasterPlain
        };
    }

    if !text.contains(TAG_EXTINF) {
        return PlaylistKind::Unknown;
    }
    if encrypted {
        return PlaylistKind::MediaEncrypted;
    }

    let mut extensions = scanned.segments.iter().map(|s| s.extension);
    let Some(first) = extensions.next() else {
        return PlaylistKind::MediaPlain;
    };
    let uniform = extensions.all(|ext| ext == first);
    match (uniform, first) {
        (true, SegmentExtension::Ts) => PlaylistKind::MediaSegmentsTs,
        (true, SegmentExtension::M4s) => PlaylistKind::MediaSegmentsM4s,
        _ => PlaylistKind::MediaSegmentsMixed,
    }
}

/// Pick the highest-resolution variant of a master playlist.
pub fn select_highest_resolution(master_text: &str) -> Result<(Resolution, String)> {
    select_variant(master_text, VariantChoice::Highest)
}

/// Pick a variant of a master playlist by rank.
pub fn select_variant(master_text: &str, choice: VariantChoice) -> Result<(Resolution, String)> {
    Playlist::parse(master_text)
        .select_variant(choice)
        .map(|(resolution, variant)| (resolution, variant.url.clone()))
        .ok_or(HlsError::NoVariantsFound)
}

/// URI of the first alternate audio rendition, if the master declares one.
pub fn select_audio_rendition(master_text: &str) -> Option<String> {
    Playlist::parse(master_text)
        .audio_rendition()
        .and_then(|r| r.uri.clone())
}

/// Directory part of a playlist URL, with a trailing slash.
///
/// A trailing slash on the input is dropped first. Returns an empty string when no path
/// segment names a playlist file; the host is never considered.
pub fn base_path(url: &str) -> String {
    let trimmed = url.strip_suffix('/').unwrap_or(url);
    let Ok(mut parsed) = Url::parse(trimmed) else {
        return String::new();
    };
    let Some(segments) = parsed.path_segments() else {
        return String::new();
    };
    let segments: Vec<String> = segments.map(str::to_string).collect();
    let Some(index) = segments.iter().position(|s| s.contains(".m3u8")) else {
        return String::new();
    };

    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.set_path(&format!("/{}", segments[..index].join("/")));
    let base = parsed.to_string();
    if base.ends_with('/') {
        base
    } else {
        format!("{base}/")
    }
}

/// Resolve a playlist reference against a base.
///
/// Absolute `http(s)` references are returned untouched. Relative ones are joined onto
/// `base` treated as a directory; if `base` is not a parseable URL the two strings are
/// concatenated. `None` when a relative reference has no base to resolve against.
pub fn resolve_url(base: Option<&str>, reference: &str) -> Option<String> {
    let reference = reference.trim();
    if is_absolute(reference) {
        return Some(reference.to_string());
    }

    let base = base.filter(|b| !b.is_empty())?;
    let directory = if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    };

    match Url::parse(&directory).and_then(|b| b.join(reference)) {
        Ok(joined) => Some(joined.to_string()),
        Err(_) => Some(format!("{directory}{}", reference.trim_start_matches('/'))),
    }
}

fn is_absolute(reference: &str) -> bool {
    let lower = reference.get(..8).unwrap_or(reference).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[derive(Debug, Default)]
struct Scanned {
    variants: Vec<Variant>,
    renditions: Vec<Rendition>,
    segments: Vec<SegmentRef>,
    keys: Vec<KeyDirective>,
    media_sequence: u64,
}

/// What the scanner expects the next URI line to be.
#[derive(Debug)]
enum Pending {
    Nothing,
    Variant(Variant),
}

/// Single pass over the playlist lines.
///
/// Tags update the scanner context; a `#EXT-X-STREAM-INF` arms the scanner so that the
/// next URI line becomes that variant's URL, regardless of comments or other tags in
/// between. Every other URI line is a segment.
fn scan(text: &str) -> Scanned {
    let mut out = Scanned::default();
    let mut pending = Pending::Nothing;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if !line.starts_with('#') {
            match std::mem::replace(&mut pending, Pending::Nothing) {
                Pending::Variant(mut variant) => {
                    variant.url = line.to_string();
                    out.variants.push(variant);
                }
                Pending::Nothing => out.segments.push(SegmentRef {
                    index: out.segments.len(),
                    url: line.to_string(),
                    extension: SegmentExtension::from_url(line),
                }),
            }
            continue;
        }

        let Some((tag, value)) = split_tag(line) else {
            trace!(line, "skipping comment");
            continue;
        };

        match tag {
            TAG_STREAM_INF => {
                let attrs = parse_attributes(value);
                pending = Pending::Variant(Variant {
                    resolution: attr(&attrs, "RESOLUTION").and_then(|r| r.parse().ok()),
                    url: String::new(),
                    bandwidth: attr(&attrs, "BANDWIDTH").and_then(|b| b.parse().ok()),
                    codecs: attr(&attrs, "CODECS").map(str::to_string),
                    audio_group: attr(&attrs, "AUDIO").map(str::to_string),
                });
            }
            TAG_MEDIA => {
                let attrs = parse_attributes(value);
                out.renditions.push(Rendition {
                    media_type: attr(&attrs, "TYPE").unwrap_or_default().to_string(),
                    group_id: attr(&attrs, "GROUP-ID").map(str::to_string),
                    name: attr(&attrs, "NAME").map(str::to_string),
                    uri: attr(&attrs, "URI").map(str::to_string),
                    is_default: attr(&attrs, "DEFAULT")
                        .is_some_and(|d| d.eq_ignore_ascii_case("YES")),
                });
            }
            TAG_KEY => {
                let attrs = parse_attributes(value);
                out.keys.push(KeyDirective {
                    method: attr(&attrs, "METHOD").unwrap_or("NONE").to_string(),
                    uri: attr(&attrs, "URI").map(str::to_string),
                    iv: attr(&attrs, "IV").map(str::to_string),
                });
            }
            TAG_MEDIA_SEQUENCE => {
                out.media_sequence = value.trim().parse().unwrap_or(0);
            }
            _ => {}
        }
    }

    out
}

/// Split `#TAG:value` into its parts. Plain `#` comments yield `None`.
fn split_tag(line: &str) -> Option<(&str, &str)> {
    if !line.starts_with("#EXT") {
        return None;
    }
    Some(line.split_once(':').unwrap_or((line, "")))
}

/// Parse an HLS attribute list (`KEY=value,KEY="quoted, value"`).
fn parse_attributes(input: &str) -> Vec<(&str, &str)> {
    let mut attrs = Vec::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else {
            break;
        };
        let name = rest[..eq].trim();
        let after = rest[eq + 1..].trim_start();

        let (value, remainder) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => {
                    let tail = &quoted[end + 1..];
                    let next = tail.find(',').map_or("", |c| &tail[c + 1..]);
                    (&quoted[..end], next)
                }
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(c) => (after[..c].trim(), &after[c + 1..]),
                None => (after.trim(), ""),
            }
        };

        attrs.push((name, value));
        rest = remainder.trim_start();
    }

    attrs
}

fn attr<'a>(attrs: &[(&str, &'a str)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| *value)
}
