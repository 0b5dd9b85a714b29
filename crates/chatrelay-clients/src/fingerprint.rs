use std::ops::RangeInclusive;

use chatrelay_core::CoreError;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use sha2::{Digest, Sha256};

pub const DOLPHIN_CHROME_VERSIONS: RangeInclusive<u32> = 128..=140;
pub const ZAI_CHROME_VERSIONS: RangeInclusive<u32> = 138..=140;

pub const ACCEPT_LANGUAGE_SHORT: &str = "zh-CN,zh;q=0.9,en;q=0.8";
pub const ACCEPT_LANGUAGE_LONG: &str = "zh-CN,zh;q=0.9,en;q=0.8,en-GB;q=0.7,en-US;q=0.6";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Windows, Platform::MacOs, Platform::Linux];

    /// Value of `sec-ch-ua-platform`, quotes included.
    pub fn client_hint(self) -> &'static str {
        match self {
            Self::Windows => "\"Windows\"",
            Self::MacOs => "\"macOS\"",
            Self::Linux => "\"Linux\"",
        }
    }

    fn os_token(self) -> &'static str {
        match self {
            Self::Windows => "Windows NT 10.0; Win64; x64",
            Self::MacOs => "Macintosh; Intel Mac OS X 10_15_7",
            Self::Linux => "X11; Linux x86_64",
        }
    }
}

/// Where a request claims to come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteContext {
    pub origin: String,
    pub referer: String,
    pub accept: &'static str,
    pub accept_language: &'static str,
}

impl SiteContext {
    pub fn new(origin: &str, referer_path: &str, accept: &'static str) -> Self {
        let origin = origin.trim_end_matches('/').to_string();
        let referer = format!("{origin}{referer_path}");
        Self { origin, referer, accept, accept_language: ACCEPT_LANGUAGE_SHORT }
    }

    pub fn with_accept_language(mut self, accept_language: &'static str) -> Self {
        self.accept_language = accept_language;
        self
    }
}

/// One randomized desktop Chrome identity. The user agent and the client hints are derived from
/// the same platform so the pair never contradicts itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrowserProfile {
    pub chrome_version: u32,
    pub platform: Platform,
}

impl BrowserProfile {
    pub fn new(chrome_version: u32, platform: Platform) -> Self {
        Self { chrome_version, platform }
    }

    pub fn random(versions: RangeInclusive<u32>) -> Self {
        let mut rng = rand::thread_rng();
        let chrome_version = rng.gen_range(versions);
        let platform = Platform::ALL[rng.gen_range(0..Platform::ALL.len())];
        Self { chrome_version, platform }
    }

    pub fn user_agent(&self) -> String {
        format!(
            "Mozilla/5.0 ({}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{}.0.0.0 Safari/537.36",
            self.platform.os_token(),
            self.chrome_version
        )
    }

    pub fn sec_ch_ua(&self) -> String {
        let version = self.chrome_version;
        format!(
            "\"Chromium\";v=\"{version}\", \"Not=A?Brand\";v=\"24\", \"Google Chrome\";v=\"{version}\""
        )
    }

    pub fn headers(&self, site: &SiteContext) -> Result<HeaderMap, CoreError> {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "accept", site.accept)?;
        insert_header(&mut headers, "accept-language", site.accept_language)?;
        insert_header(&mut headers, "content-type", "application/json")?;
        insert_header(&mut headers, "origin", &site.origin)?;
        insert_header(&mut headers, "referer", &site.referer)?;
        insert_header(&mut headers, "user-agent", &self.user_agent())?;
        insert_header(&mut headers, "sec-ch-ua", &self.sec_ch_ua())?;
        insert_header(&mut headers, "sec-ch-ua-mobile", "?0")?;
        insert_header(&mut headers, "sec-ch-ua-platform", self.platform.client_hint())?;
        insert_header(&mut headers, "sec-fetch-dest", "empty")?;
        insert_header(&mut headers, "sec-fetch-mode", "cors")?;
        insert_header(&mut headers, "sec-fetch-site", "same-origin")?;
        insert_header(&mut headers, "priority", "u=1, i")?;
        Ok(headers)
    }
}

pub fn insert_header(
    headers: &mut HeaderMap,
    name: &'static str,
    value: &str,
) -> Result<(), CoreError> {
    let value = HeaderValue::from_str(value)
        .map_err(|err| CoreError::Internal(format!("invalid value for header {name}: {err}")))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

/// Lowercase hex SHA-256 of the exact bytes that go on the wire.
pub fn body_signature(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}
