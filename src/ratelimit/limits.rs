//! Textual rate-limit specifications.
//!
//! Accepted forms, case-insensitive, optional plural `s`:
//!
//! * `10/second`, `10/2 minutes`
//! * `10 per hour`, `10 per 3 days`
//!
//! Several limits can be combined with `;`, `,` or `|`.

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
    /// Thirty days.
    Month,
    /// 365 days.
    Year,
}

impl Granularity {
    pub fn seconds(self) -> u64 {
        match self {
            Granularity::Second => 1,
            Granularity::Minute => 60,
            Granularity::Hour => 60 * 60,
            Granularity::Day => 24 * 60 * 60,
            Granularity::Month => 30 * 24 * 60 * 60,
            Granularity::Year => 365 * 24 * 60 * 60,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }

    fn parse(word: &str) -> Option<Self> {
        let word = word.to_ascii_lowercase();
        let singular = word.strip_suffix('s').unwrap_or(&word);
        match singular {
            "second" => Some(Granularity::Second),
            "minute" => Some(Granularity::Minute),
            "hour" => Some(Granularity::Hour),
            "day" => Some(Granularity::Day),
            "month" => Some(Granularity::Month),
            "year" => Some(Granularity::Year),
            _ => None,
        }
    }
}

/// `amount` units per window of `multiples` × `granularity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateLimit {
    pub amount: u64,
    pub multiples: u64,
    pub granularity: Granularity,
}

impl RateLimit {
    pub fn new(amount: u64, multiples: u64, granularity: Granularity) -> Self {
        Self {
            amount,
            multiples: multiples.max(1),
            granularity,
        }
    }

    pub fn per_second(amount: u64) -> Self {
        Self::new(amount, 1, Granularity::Second)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.multiples.saturating_mul(self.granularity.seconds()))
    }

    /// Bucket-key suffix identifying this limit, `<amount>/<multiples>/<granularity>`.
    pub fn key_fragment(&self) -> String {
        format!(
            "{}/{}/{}",
            self.amount,
            self.multiples,
            self.granularity.name()
        )
    }

    pub fn parse(input: &str) -> Result<Self, RateLimitParseError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(RateLimitParseError::Empty);
        }
        let malformed = |reason| RateLimitParseError::Malformed {
            input: trimmed.to_owned(),
            reason,
        };

        let lowered = trimmed.to_ascii_lowercase();
        let (amount, rest) = if let Some((amount, rest)) = lowered.split_once('/') {
            (amount.trim(), rest.trim())
        } else if let Some((amount, rest)) = lowered.split_once(" per ") {
            (amount.trim(), rest.trim())
        } else {
            return Err(malformed("expected '/' or 'per'"));
        };

        let amount: u64 = amount.parse().map_err(|_| malformed("invalid amount"))?;
        if amount == 0 {
            return Err(malformed("amount must be greater than 0"));
        }

        let digits = rest.chars().take_while(char::is_ascii_digit).count();
        let (multiples, unit) = rest.split_at(digits);
        let multiples = if multiples.is_empty() {
            1
        } else {
            multiples
                .parse::<u64>()
                .map_err(|_| malformed("invalid window multiple"))?
        };
        if multiples == 0 {
            return Err(malformed("window multiple must be greater than 0"));
        }

        let granularity =
            Granularity::parse(unit.trim()).ok_or_else(|| malformed("unknown granularity"))?;

        Ok(Self::new(amount, multiples, granularity))
    }

    /// Parses a list of limits separated by `;`, `,` or `|`.
    pub fn parse_many(input: &str) -> Result<Vec<Self>, RateLimitParseError> {
        let limits = input
            .split([';', ',', '|'])
            .filter(|part| !part.trim().is_empty())
            .map(Self::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if limits.is_empty() {
            return Err(RateLimitParseError::Empty);
        }
        Ok(limits)
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.multiples == 1 {
            write!(f, "{} per {}", self.amount, self.granularity.name())
        } else {
            write!(
                f,
                "{} per {} {}s",
                self.amount,
                self.multiples,
                self.granularity.name()
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitParseError {
    Empty,
    Malformed { input: String, reason: &'static str },
}

impl fmt::Display for RateLimitParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitParseError::Empty => write!(f, "rate limit string is empty"),
            RateLimitParseError::Malformed { input, reason } => {
                write!(f, "invalid rate limit {input:?}: {reason}")
            }
        }
    }
}

impl std::error::Error for RateLimitParseError {}
