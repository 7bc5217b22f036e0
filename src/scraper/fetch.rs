use std::time::Duration;

use rand::{Rng, seq::IndexedRandom};
use tracing::{info, warn};
use url::Url;

use super::ScrapeError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: u32 = 10;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
];

/// True when the URL parses and names both a scheme and a host.
pub fn is_valid_url(value: &str) -> bool {
    Url::parse(value)
        .map(|url| !url.scheme().is_empty() && url.host_str().is_some_and(|host| !host.is_empty()))
        .unwrap_or(false)
}

/// Browser-like request headers with a User-Agent picked at random.
pub fn random_headers() -> Vec<(&'static str, &'static str)> {
    let user_agent = USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(USER_AGENTS[0]);
    vec![
        ("User-Agent", user_agent),
        (
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
        ("Accept-Language", "en-US,en;q=0.5"),
        ("Upgrade-Insecure-Requests", "1"),
    ]
}

/// A uniformly random pause in `[base, 2 * base]`.
pub fn random_delay(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let secs = base.as_secs_f64();
    Duration::from_secs_f64(rand::rng().random_range(secs..=secs * 2.0))
}

/// Blocking HTTP GET with retries. Call through `spawn_blocking` from async
/// code; the pauses between attempts sleep the current thread.
#[derive(Clone)]
pub struct Fetcher {
    agent: ureq::Agent,
    delay: Duration,
    max_retries: u32,
}

enum Attempt {
    Retry(String),
    Fatal(ScrapeError),
}

impl Fetcher {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(REQUEST_TIMEOUT)
            .redirects(MAX_REDIRECTS)
            .build();
        Self {
            agent,
            delay,
            max_retries: max_retries.max(1),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn fetch(&self, url: &str) -> Result<String, ScrapeError> {
        if !is_valid_url(url) {
            return Err(ScrapeError::InvalidUrl(url.to_string()));
        }

        let mut last_error = String::new();
        for attempt in 1..=self.max_retries {
            info!(url, attempt, "fetching page");
            match self.fetch_once(url) {
                Ok(body) => {
                    info!(url, bytes = body.len(), "fetched page");
                    return Ok(body);
                }
                Err(Attempt::Fatal(err)) => return Err(err),
                Err(Attempt::Retry(reason)) => {
                    warn!(url, attempt, %reason, "fetch attempt failed");
                    last_error = reason;
                }
            }
            if attempt < self.max_retries {
                let pause = random_delay(self.delay);
                info!(url, pause_secs = pause.as_secs_f64(), "waiting before retry");
                std::thread::sleep(pause);
            }
        }

        Err(ScrapeError::Fetch {
            attempts: self.max_retries,
            reason: last_error,
        })
    }

    fn fetch_once(&self, url: &str) -> Result<String, Attempt> {
        let mut request = self.agent.get(url);
        for (name, value) in random_headers() {
            request = request.set(name, value);
        }
        match request.call() {
            Ok(response) => response
                .into_string()
                .map_err(|err| Attempt::Retry(format!("reading body: {err}"))),
            Err(ureq::Error::Status(code, response)) => Err(Attempt::Retry(format!(
                "HTTP {code} {}",
                response.status_text()
            ))),
            Err(ureq::Error::Transport(transport))
                if transport.kind() == ureq::ErrorKind::TooManyRedirects =>
            {
                Err(Attempt::Fatal(ScrapeError::TooManyRedirects))
            }
            Err(ureq::Error::Transport(transport)) => Err(Attempt::Retry(transport.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_validation() {
        assert!(is_valid_url("https://example.com"));
        assert!(is_valid_url("http://localhost:8080/path?q=1"));
        assert!(!is_valid_url("example.com"));
        assert!(!is_valid_url("not a url"));
        assert!(!is_valid_url("mailto:someone@example.com"));
        assert!(!is_valid_url(""));
    }

    #[test]
    fn delay_stays_within_bounds() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let pause = random_delay(base);
            assert!(pause >= base && pause <= base * 2);
        }
        assert_eq!(random_delay(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn headers_carry_known_user_agent() {
        let headers = random_headers();
        let (_, agent) = headers
            .iter()
            .find(|(name, _)| *name == "User-Agent")
            .unwrap();
        assert!(USER_AGENTS.contains(agent));
    }

    #[test]
    fn invalid_url_fails_without_network() {
        let fetcher = Fetcher::new(Duration::ZERO, 3);
        let err = fetcher.fetch("nope").unwrap_err();
        assert!(matches!(err, ScrapeError::InvalidUrl(_)));
    }
}
