use std::str::FromStr;

/// Video resolution as advertised by a playlist `RESOLUTION=WxH` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    #[inline]
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total pixel count, used to rank variants.
    #[inline]
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Error returned when a `WxH` string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseResolutionError {
    input: String,
}

impl std::fmt::Display for ParseResolutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid resolution `{}`, expected WIDTHxHEIGHT", self.input)
    }
}

impl std::error::Error for ParseResolutionError {}

impl FromStr for Resolution {
    type Err = ParseResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseResolutionError {
            input: s.to_string(),
        };
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(err)?;
        let width = w.trim().parse::<u32>().map_err(|_| err())?;
        let height = h.trim().parse::<u32>().map_err(|_| err())?;
        Ok(Self::new(width, height))
    }
}
