use super::error::CpError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What the owners publish, each publication gets the next id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Photo {
    pub id: u64,
    pub file_name: String,
}

impl Photo {
    pub fn new(id: u64, file_name: impl Into<String>) -> Self {
        Photo {
            id,
            file_name: file_name.into(),
        }
    }

    /// The id following `current`, 1 for the first photo
    pub fn next_id(current: Option<&Photo>) -> u64 {
        current.map_or(1, |photo| photo.id + 1)
    }
}

impl fmt::Display for Photo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Photo{{id={}, fileName='{}'}}", self.id, self.file_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pet {
    Cat,
    Dog,
}

impl Pet {
    pub fn name(self) -> &'static str {
        match self {
            Pet::Cat => "cat",
            Pet::Dog => "dog",
        }
    }

    pub fn emoji(self) -> &'static str {
        match self {
            Pet::Cat => "🐱",
            Pet::Dog => "🐶",
        }
    }

    /// `<pet><n>.png` with `n` picked from `1..=variants`
    pub fn random_file_name(self, variants: u32) -> String {
        format!("{}{}.png", self.name(), random_between(1, variants.max(1) as u64))
    }
}

impl fmt::Display for Pet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Pet {
    type Err = CpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cat" => Ok(Pet::Cat),
            "dog" => Ok(Pet::Dog),
            _ => Err(CpError::Validation(format!(
                "expected a single pet, cat|dog, got '{}'",
                s
            ))),
        }
    }
}

/// Uniform in `min..=max`
pub(crate) fn random_between(min: u64, max: u64) -> u64 {
    if max <= min {
        return min;
    }
    let rand: f64 = random_number::rand::random();
    let span = max - min + 1;
    min + ((span as f64 * rand) as u64).min(span - 1)
}
