#![forbid(unsafe_code)]

//! Maps raw user-submitted URLs to a provider and a provider-specific id.
//!
//! Classification is a pure function of the input string: no network, no
//! caches. The provider is decided by the URL's host alone; anything we cannot
//! place is reported as unsupported rather than guessed at.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

/// Supported media platforms plus the catch-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    YouTube,
    Spotify,
    SoundCloud,
    Unsupported,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::YouTube => "youtube",
            Self::Spotify => "spotify",
            Self::SoundCloud => "soundcloud",
            Self::Unsupported => "unsupported",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "youtube" | "yt" => Some(Self::YouTube),
            "spotify" => Some(Self::Spotify),
            "soundcloud" | "sc" => Some(Self::SoundCloud),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rough shape of a SoundCloud page, derived from its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoundCloudKind {
    User,
    Track,
    Set,
    Other,
}

/// Result of classifying a URL.
///
/// `Malformed` means the host belongs to a known provider but no id could be
/// extracted; callers treat it as unsupported, but the resolver reports it as
/// a parse failure instead of an unknown format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderRef {
    YouTube {
        video_id: String,
    },
    Spotify {
        kind: String,
        id: String,
    },
    SoundCloud {
        url: String,
        kind: SoundCloudKind,
    },
    Malformed {
        recognized: Provider,
    },
    Unsupported,
}

impl ProviderRef {
    pub fn provider(&self) -> Provider {
        match self {
            Self::YouTube { .. } => Provider::YouTube,
            Self::Spotify { .. } => Provider::Spotify,
            Self::SoundCloud { .. } => Provider::SoundCloud,
            Self::Malformed { .. } | Self::Unsupported => Provider::Unsupported,
        }
    }

    /// Provider-specific id: the video id, `{type}/{id}` for Spotify and the
    /// normalized page URL for SoundCloud.
    pub fn external_id(&self) -> Option<String> {
        match self {
            Self::YouTube { video_id } => Some(video_id.clone()),
            Self::Spotify { kind, id } => Some(format!("{kind}/{id}")),
            Self::SoundCloud { url, .. } => Some(url.clone()),
            Self::Malformed { .. } | Self::Unsupported => None,
        }
    }

    /// Composite `(provider, externalId)` key used by the metadata cache.
    pub fn cache_key(&self) -> Option<String> {
        self.external_id()
            .map(|id| format!("{}:{}", self.provider(), id))
    }

    pub fn is_supported(&self) -> bool {
        self.provider() != Provider::Unsupported
    }
}

// Path shape on a YouTube host, then exactly eleven id characters ending at
// `&`, `?`, `#`, `/`, whitespace or the end of input.
static YOUTUBE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i:youtube\.com/(?:watch\?(?:[^#\s]*?&)?v=|embed/|v/|shorts/|live/)|youtu\.be/)([A-Za-z0-9_-]{11})(?:[&?#/\s]|$)",
    )
    .expect("static youtube pattern compiles")
});

const YOUTUBE_HOSTS: [&str; 2] = ["youtube.com", "youtu.be"];
const SPOTIFY_HOST: &str = "spotify.com";
const SOUNDCLOUD_HOST: &str = "soundcloud.com";

/// Classifies `url` into a provider reference.
pub fn classify(url: &str) -> ProviderRef {
    let trimmed = url.trim();
    let Some(host) = host_of(trimmed) else {
        return ProviderRef::Unsupported;
    };

    match provider_for_host(&host) {
        Provider::YouTube => match youtube_id(trimmed) {
            Some(video_id) => ProviderRef::YouTube { video_id },
            None => ProviderRef::Malformed {
                recognized: Provider::YouTube,
            },
        },
        Provider::Spotify => match spotify_parts(trimmed) {
            Some((kind, id)) => ProviderRef::Spotify { kind, id },
            None => ProviderRef::Malformed {
                recognized: Provider::Spotify,
            },
        },
        Provider::SoundCloud => {
            let (url, kind) = normalize_soundcloud(trimmed);
            ProviderRef::SoundCloud { url, kind }
        }
        Provider::Unsupported => ProviderRef::Unsupported,
    }
}

/// Lowercased host of `input`. Input without a scheme
/// (`soundcloud.com/artist`) uses its leading segment as the host.
fn host_of(input: &str) -> Option<String> {
    if let Ok(parsed) = Url::parse(input)
        && let Some(host) = parsed.host_str()
    {
        return Some(host.to_ascii_lowercase());
    }
    if input.contains("://") {
        return None;
    }
    let leading = input.split(['/', '?', '#']).next()?;
    let host = leading.split(':').next()?.trim();
    (!host.is_empty() && !host.contains(char::is_whitespace))
        .then(|| host.to_ascii_lowercase())
}

fn provider_for_host(host: &str) -> Provider {
    let on = |domain: &str| {
        host == domain
            || host
                .strip_suffix(domain)
                .is_some_and(|prefix| prefix.ends_with('.'))
    };
    if YOUTUBE_HOSTS.iter().any(|domain| on(domain)) {
        Provider::YouTube
    } else if on(SPOTIFY_HOST) {
        Provider::Spotify
    } else if on(SOUNDCLOUD_HOST) {
        Provider::SoundCloud
    } else {
        Provider::Unsupported
    }
}

/// Extracts an eleven character video id from any supported YouTube shape.
pub fn youtube_id(url: &str) -> Option<String> {
    YOUTUBE_ID
        .captures(url)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str().to_owned())
}

/// Returns `(type, id)` from the last two path segments. The type is not
/// checked against Spotify's entity kinds.
fn spotify_parts(url: &str) -> Option<(String, String)> {
    let lowered = url.to_ascii_lowercase();
    let start = lowered.find(SPOTIFY_HOST)? + SPOTIFY_HOST.len();
    let path = &url[start..];
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let segments: Vec<&str> = path
        .split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect();
    let [.., kind, id] = segments.as_slice() else {
        return None;
    };
    Some((kind.to_string(), id.to_string()))
}

/// Canonical SoundCloud page URL: https, bare host, no query or fragment, no
/// trailing slash.
fn normalize_soundcloud(url: &str) -> (String, SoundCloudKind) {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment
        .split('?')
        .next()
        .unwrap_or(without_fragment);

    let lowered = without_query.to_ascii_lowercase();
    let Some(host_at) = lowered.find(SOUNDCLOUD_HOST) else {
        return (without_query.trim_end_matches('/').to_owned(), SoundCloudKind::Other);
    };

    // Keep short-link hosts (on.soundcloud.com) intact, fold m./www. into the
    // canonical host.
    let prefix = &lowered[..host_at];
    let subdomain = prefix
        .rsplit(['/', '.'])
        .nth(1)
        .filter(|_| prefix.ends_with('.'))
        .unwrap_or("");
    let host = match subdomain {
        "" | "www" | "m" => SOUNDCLOUD_HOST.to_owned(),
        other => format!("{other}.{SOUNDCLOUD_HOST}"),
    };

    let path = without_query[host_at + SOUNDCLOUD_HOST.len()..].trim_end_matches('/');
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let kind = match segments.as_slice() {
        [_user] => SoundCloudKind::User,
        [_user, "sets", _set] => SoundCloudKind::Set,
        [_user, track] if *track != "sets" => SoundCloudKind::Track,
        _ => SoundCloudKind::Other,
    };

    let mut normalized = format!("https://{host}");
    for segment in &segments {
        normalized.push('/');
        normalized.push_str(segment);
    }
    (normalized, kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "dQw4w9WgXcQ";

    #[test]
    fn youtube_shapes_share_the_same_id() {
        let variants = [
            format!("https://www.youtube.com/watch?v={ID}"),
            format!("https://youtube.com/watch?feature=share&v={ID}&t=42"),
            format!("https://youtu.be/{ID}?si=abc"),
            format!("https://www.youtube.com/embed/{ID}#start"),
            format!("http://youtube.com/v/{ID}"),
            format!("https://m.youtube.com/watch?v={ID}\n"),
            format!("https://music.youtube.com/watch?v={ID}&list=RD"),
            format!("https://www.youtube.com/shorts/{ID}"),
        ];
        for url in variants {
            assert_eq!(
                classify(&url),
                ProviderRef::YouTube {
                    video_id: ID.into()
                },
                "{url}"
            );
        }
    }

    #[test]
    fn classification_is_deterministic() {
        let url = format!("https://youtu.be/{ID}");
        let first = classify(&url);
        for _ in 0..5 {
            assert_eq!(classify(&url), first);
        }
    }

    #[test]
    fn youtube_domain_without_id_is_malformed() {
        let result = classify("https://www.youtube.com/@lofigirl");
        assert_eq!(
            result,
            ProviderRef::Malformed {
                recognized: Provider::YouTube
            }
        );
        assert_eq!(result.provider(), Provider::Unsupported);
        assert!(result.external_id().is_none());
    }

    #[test]
    fn short_ids_are_rejected() {
        assert!(youtube_id("https://youtu.be/abc").is_none());
    }

    #[test]
    fn overlong_ids_are_rejected() {
        assert!(youtube_id(&format!("https://youtu.be/{ID}extra")).is_none());
        assert_eq!(
            classify(&format!("https://www.youtube.com/watch?v={ID}extra")),
            ProviderRef::Malformed {
                recognized: Provider::YouTube
            }
        );
        assert_eq!(
            youtube_id(&format!("https://www.youtube.com/shorts/{ID}/")).as_deref(),
            Some(ID)
        );
    }

    #[test]
    fn provider_follows_the_host_not_the_query() {
        assert_eq!(
            classify("https://open.spotify.com/track/4uLU6hMCjMI75M1A2tKUQC?utm_source=youtube.com"),
            ProviderRef::Spotify {
                kind: "track".into(),
                id: "4uLU6hMCjMI75M1A2tKUQC".into()
            }
        );
        assert_eq!(
            classify("https://soundcloud.com/artist/track#via=youtu.be"),
            ProviderRef::SoundCloud {
                url: "https://soundcloud.com/artist/track".into(),
                kind: SoundCloudKind::Track,
            }
        );
        assert_eq!(
            classify(&format!("https://example.com/share?u=https://youtu.be/{ID}")),
            ProviderRef::Unsupported
        );
        assert_eq!(
            classify("https://notyoutube.com/watch?v=dQw4w9WgXcQ"),
            ProviderRef::Unsupported
        );
    }

    #[test]
    fn schemeless_links_use_the_leading_host() {
        assert_eq!(
            classify(&format!("www.youtube.com/watch?v={ID}")),
            ProviderRef::YouTube {
                video_id: ID.into()
            }
        );
        assert_eq!(classify("example.com/soundcloud.com/x"), ProviderRef::Unsupported);
    }

    #[test]
    fn spotify_uses_last_two_segments() {
        let result = classify("https://open.spotify.com/intl-de/playlist/37i9dQZF1DX8Uebhn9wzrS?si=xyz");
        assert_eq!(
            result,
            ProviderRef::Spotify {
                kind: "playlist".into(),
                id: "37i9dQZF1DX8Uebhn9wzrS".into()
            }
        );
        assert_eq!(
            result.external_id().as_deref(),
            Some("playlist/37i9dQZF1DX8Uebhn9wzrS")
        );
    }

    #[test]
    fn spotify_unknown_types_pass_through() {
        let result = classify("https://open.spotify.com/audiobook/7iHfbu1YPACw6oZPAFJtqe");
        assert_eq!(
            result,
            ProviderRef::Spotify {
                kind: "audiobook".into(),
                id: "7iHfbu1YPACw6oZPAFJtqe".into()
            }
        );
    }

    #[test]
    fn spotify_without_path_is_malformed() {
        assert_eq!(
            classify("https://open.spotify.com/"),
            ProviderRef::Malformed {
                recognized: Provider::Spotify
            }
        );
    }

    #[test]
    fn soundcloud_urls_are_normalized() {
        let track = classify("https://m.soundcloud.com/artist/late-night-study/?in=x#t=1");
        assert_eq!(
            track,
            ProviderRef::SoundCloud {
                url: "https://soundcloud.com/artist/late-night-study".into(),
                kind: SoundCloudKind::Track,
            }
        );

        let set = classify("soundcloud.com/artist/sets/focus/");
        assert_eq!(
            set,
            ProviderRef::SoundCloud {
                url: "https://soundcloud.com/artist/sets/focus".into(),
                kind: SoundCloudKind::Set,
            }
        );

        let user = classify("https://www.soundcloud.com/artist");
        assert_eq!(
            user,
            ProviderRef::SoundCloud {
                url: "https://soundcloud.com/artist".into(),
                kind: SoundCloudKind::User,
            }
        );
    }

    #[test]
    fn soundcloud_short_links_keep_their_host() {
        let short = classify("https://on.soundcloud.com/AbCdEf");
        assert_eq!(
            short.external_id().as_deref(),
            Some("https://on.soundcloud.com/AbCdEf")
        );
    }

    #[test]
    fn garbage_is_unsupported() {
        let result = classify("not a url at all");
        assert_eq!(result, ProviderRef::Unsupported);
        assert_eq!(result.provider(), Provider::Unsupported);
        assert!(result.external_id().is_none());
        assert_eq!(classify("https://vimeo.com/12345"), ProviderRef::Unsupported);
    }

    #[test]
    fn cache_keys_are_provider_scoped() {
        let result = classify(&format!("https://youtu.be/{ID}"));
        assert_eq!(result.cache_key(), Some(format!("youtube:{ID}")));
    }

    #[test]
    fn provider_parse_accepts_aliases() {
        assert_eq!(Provider::parse(" YT "), Some(Provider::YouTube));
        assert_eq!(Provider::parse("soundcloud"), Some(Provider::SoundCloud));
        assert_eq!(Provider::parse("vimeo"), None);
    }
}
