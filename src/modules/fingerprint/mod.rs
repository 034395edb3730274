//! Browser fingerprint profiles.
//!
//! A profile bundles the observable surface one egress identity presents:
//! user-agent, language, viewport, and timezone. Profiles are drawn from
//! pools of realistic values and stay bound to an identity for a whole
//! rotation epoch; a redraw produces a new profile rather than mutating the
//! old one.

use std::collections::HashMap;

use rand::Rng;
use rand::seq::SliceRandom;
use rand::thread_rng;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:123.0) Gecko/20100101 Firefox/123.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:123.0) Gecko/20100101 Firefox/123.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

const LANGUAGES: &[&str] = &[
    "en-US", "en-GB", "en-CA", "en", "fr-FR", "de-DE", "es-ES", "it-IT", "pt-BR",
];

const VIEWPORTS: &[(u32, u32)] = &[
    (1920, 1080),
    (1366, 768),
    (1536, 864),
    (1440, 900),
    (1280, 720),
    (1600, 900),
    (2560, 1440),
];

const TIMEZONE_OFFSETS: &[i32] = &[
    -480, -420, -360, -300, -240, -180, -120, -60, 0, 60, 120, 180,
];

/// Observable browser surface bound to one identity for a rotation epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintProfile {
    pub user_agent: String,
    pub accept_language: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub timezone_offset_minutes: i32,
}

impl FingerprintProfile {
    /// Draw a fresh profile from the realistic value pools.
    pub fn draw() -> Self {
        let mut rng = thread_rng();
        let user_agent = choose(USER_AGENTS, &mut rng).to_string();
        let language = choose(LANGUAGES, &mut rng);
        let (viewport_width, viewport_height) = *VIEWPORTS
            .choose(&mut rng)
            .expect("viewport pool is non-empty");
        let timezone_offset_minutes = *TIMEZONE_OFFSETS
            .choose(&mut rng)
            .expect("timezone pool is non-empty");

        Self {
            user_agent,
            accept_language: format!("{language},en-US;q=0.9,en;q=0.8"),
            viewport_width,
            viewport_height,
            timezone_offset_minutes,
        }
    }

    /// Synthesize the browser-like request headers for this profile.
    ///
    /// Chrome agents additionally receive client-hint headers so the
    /// presented surface stays internally consistent.
    pub fn headers(&self, referer: Option<&str>) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("User-Agent".into(), self.user_agent.clone());
        headers.insert(
            "Accept".into(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8"
                .into(),
        );
        headers.insert("Accept-Language".into(), self.accept_language.clone());
        headers.insert("DNT".into(), "1".into());
        headers.insert("Upgrade-Insecure-Requests".into(), "1".into());
        headers.insert("Sec-Fetch-Dest".into(), "document".into());
        headers.insert("Sec-Fetch-Mode".into(), "navigate".into());
        headers.insert("Sec-Fetch-Site".into(), "cross-site".into());
        headers.insert(
            "Referer".into(),
            referer.unwrap_or("https://www.google.com/").into(),
        );

        if let Some(version) = chrome_major_version(&self.user_agent) {
            headers.insert(
                "Sec-Ch-Ua".into(),
                format!(
                    "\"Google Chrome\";v=\"{version}\", \"Chromium\";v=\"{version}\", \";Not A Brand\";v=\"99\""
                ),
            );
            headers.insert("Sec-Ch-Ua-Mobile".into(), "?0".into());
            headers.insert("Viewport-Width".into(), self.viewport_width.to_string());
        }

        headers
    }
}

fn choose<'a>(pool: &[&'a str], rng: &mut impl Rng) -> &'a str {
    pool.choose(rng).copied().expect("value pool is non-empty")
}

fn chrome_major_version(user_agent: &str) -> Option<&str> {
    let rest = user_agent.split("Chrome/").nth(1)?;
    let version = rest.split('.').next()?;
    (!version.is_empty()).then_some(version)
}
