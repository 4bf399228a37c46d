// crates/core/src/options.rs
//! Separation request options and their allow-lists.
//!
//! Every value a client can influence is parsed into one of the closed types
//! below. Nothing downstream (argument lists, file names, directory names)
//! is ever built from the raw request strings.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{OptionField, ValidationError};

/// Declares a closed string enum: `as_str`, `ALL`, `Display` and a `FromStr`
/// that rejects with the given [`OptionField`].
macro_rules! closed_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $field:expr, { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(ValidationError::InvalidOption($field)),
                }
            }
        }
    };
}

closed_enum!(
    /// Container format of the delivered stems.
    OutputFormat, OptionField::OutputFormat, {
        Mp3 => "mp3",
        Wav => "wav",
        Flac => "flac",
    }
);

closed_enum!(
    /// Whether every stem is delivered or one stem plus a combined backing track.
    StemMode, OptionField::StemMode, {
        All => "all",
        Isolate => "isolate",
    }
);

closed_enum!(
    /// One isolated instrument/voice track.
    Stem, OptionField::IsolateStem, {
        Vocals => "vocals",
        Drums => "drums",
        Bass => "bass",
        Other => "other",
        Guitar => "guitar",
        Piano => "piano",
    }
);

closed_enum!(
    /// Pretrained separation model passed to the tool with `-n`.
    Model, OptionField::Model, {
        Htdemucs => "htdemucs",
        HtdemucsFt => "htdemucs_ft",
        Htdemucs6s => "htdemucs_6s",
        HdemucsMmi => "hdemucs_mmi",
        Mdx => "mdx",
        MdxExtra => "mdx_extra",
        MdxQ => "mdx_q",
        MdxExtraQ => "mdx_extra_q",
    }
);

closed_enum!(
    /// How the tool avoids clipping in its output.
    ClipMode, OptionField::ClipMode, {
        Rescale => "rescale",
        Clamp => "clamp",
        None => "none",
    }
);

const FOUR_STEMS: &[Stem] = &[Stem::Drums, Stem::Bass, Stem::Other, Stem::Vocals];
const SIX_STEMS: &[Stem] = &[
    Stem::Drums,
    Stem::Bass,
    Stem::Other,
    Stem::Vocals,
    Stem::Guitar,
    Stem::Piano,
];

/// Models producing guitar and piano in addition to the four base stems.
pub const SIX_STEM_MODELS: &[Model] = &[Model::Htdemucs6s];

/// Longest segment (seconds) a transformer model accepts.
pub const TRANSFORMER_MAX_SEGMENT: u32 = 7;

impl Model {
    /// Stems the tool writes for this model, in the tool's own order.
    pub fn stems(&self) -> &'static [Stem] {
        if SIX_STEM_MODELS.contains(self) {
            SIX_STEMS
        } else {
            FOUR_STEMS
        }
    }

    pub fn produces(&self, stem: Stem) -> bool {
        self.stems().contains(&stem)
    }

    /// Hybrid transformer models refuse segments longer than they were trained on.
    pub fn is_transformer(&self) -> bool {
        matches!(self, Self::Htdemucs | Self::HtdemucsFt | Self::Htdemucs6s)
    }
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    /// Extension the separation tool itself writes for this request.
    pub fn native_extension(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Wav | Self::Flac => "wav",
        }
    }

    /// True when the tool output must be transcoded afterwards.
    pub fn needs_conversion(&self) -> bool {
        self.native_extension() != self.extension()
    }
}

pub const ALLOWED_SHIFTS: &[u32] = &[0, 1, 2, 3, 4, 5, 10];
pub const ALLOWED_SEGMENTS: &[u32] = &[5, 6, 7, 10, 15, 20, 30, 40, 60];
pub const ALLOWED_OVERLAPS: &[f64] = &[0.1, 0.25, 0.5, 0.75];

/// Upload extensions accepted by the service.
pub const ALLOWED_EXTENSIONS: &[&str] = &["mp3", "wav", "flac", "ogg", "m4a", "aac"];

fn uint_grammar() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9]{1,3}$").expect("static regex"))
}

fn fraction_grammar() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9](\.[0-9]{1,4})?$").expect("static regex"))
}

fn parse_allowed_uint(raw: &str, allowed: &[u32], field: OptionField) -> Result<u32, ValidationError> {
    if !uint_grammar().is_match(raw) {
        return Err(ValidationError::InvalidOption(field));
    }
    raw.parse::<u32>()
        .ok()
        .filter(|v| allowed.contains(v))
        .ok_or(ValidationError::InvalidOption(field))
}

/// Number of random shifts (`--shifts`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Shifts(u32);

impl Shifts {
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Default for Shifts {
    fn default() -> Self {
        Self(1)
    }
}

impl FromStr for Shifts {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_allowed_uint(s, ALLOWED_SHIFTS, OptionField::Shifts).map(Self)
    }
}

/// Segment length in seconds (`--segment`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Segment(u32);

impl Segment {
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl FromStr for Segment {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_allowed_uint(s, ALLOWED_SEGMENTS, OptionField::Segment).map(Self)
    }
}

/// Overlap fraction between segments (`--overlap`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Overlap(f64);

impl Overlap {
    pub fn get(&self) -> f64 {
        self.0
    }
}

impl Default for Overlap {
    fn default() -> Self {
        Self(0.25)
    }
}

impl FromStr for Overlap {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = ValidationError::InvalidOption(OptionField::Overlap);
        if !fraction_grammar().is_match(s) {
            return Err(invalid);
        }
        let value: f64 = s.parse().map_err(|_| invalid.clone())?;
        ALLOWED_OVERLAPS
            .iter()
            .copied()
            .find(|allowed| (allowed - value).abs() < 1e-9)
            .map(Self)
            .ok_or(invalid)
    }
}

impl fmt::Display for Overlap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Option values exactly as received from the client. Empty strings count
/// as absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawOptions {
    pub output_format: Option<String>,
    pub stem_mode: Option<String>,
    pub isolate_stem: Option<String>,
    pub model: Option<String>,
    pub clip_mode: Option<String>,
    pub shifts: Option<String>,
    pub segment: Option<String>,
    pub overlap: Option<String>,
}

impl RawOptions {
    /// Store a form field by name. Unknown names are ignored.
    pub fn set(&mut self, name: &str, value: String) -> bool {
        let slot = match name {
            "output_format" => &mut self.output_format,
            "stem_mode" => &mut self.stem_mode,
            "isolate_stem" => &mut self.isolate_stem,
            "model" => &mut self.model,
            "clip_mode" => &mut self.clip_mode,
            "shifts" => &mut self.shifts,
            "segment" => &mut self.segment,
            "overlap" => &mut self.overlap,
            _ => return false,
        };
        *slot = Some(value);
        true
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

fn parse_or<T: FromStr<Err = ValidationError>>(
    value: &Option<String>,
    default: T,
) -> Result<T, ValidationError> {
    match present(value) {
        Some(raw) => raw.parse(),
        None => Ok(default),
    }
}

/// Fully validated separation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeparationOptions {
    pub output_format: OutputFormat,
    pub stem_mode: StemMode,
    pub isolate_stem: Stem,
    pub model: Model,
    pub clip_mode: ClipMode,
    pub shifts: Shifts,
    pub segment: Option<Segment>,
    pub overlap: Overlap,
}

impl Default for SeparationOptions {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::Mp3,
            stem_mode: StemMode::All,
            isolate_stem: Stem::Vocals,
            model: Model::Htdemucs,
            clip_mode: ClipMode::Rescale,
            shifts: Shifts::default(),
            segment: None,
            overlap: Overlap::default(),
        }
    }
}

impl SeparationOptions {
    /// Validate every field against its allow-list, then the cross-field rules.
    ///
    /// Fields are checked in a fixed order so the reported error is
    /// deterministic when several are wrong.
    pub fn from_raw(raw: &RawOptions) -> Result<Self, ValidationError> {
        let defaults = Self::default();
        let options = Self {
            output_format: parse_or(&raw.output_format, defaults.output_format)?,
            stem_mode: parse_or(&raw.stem_mode, defaults.stem_mode)?,
            isolate_stem: parse_or(&raw.isolate_stem, defaults.isolate_stem)?,
            model: parse_or(&raw.model, defaults.model)?,
            clip_mode: parse_or(&raw.clip_mode, defaults.clip_mode)?,
            shifts: parse_or(&raw.shifts, defaults.shifts)?,
            segment: present(&raw.segment).map(str::parse::<Segment>).transpose()?,
            overlap: parse_or(&raw.overlap, defaults.overlap)?,
        };
        options.check_compatibility()?;
        Ok(options)
    }

    fn check_compatibility(&self) -> Result<(), ValidationError> {
        if self.stem_mode == StemMode::Isolate && !self.model.produces(self.isolate_stem) {
            return Err(ValidationError::IncompatibleIsolateStem);
        }
        if let Some(segment) = self.segment {
            if self.model.is_transformer() && segment.get() > TRANSFORMER_MAX_SEGMENT {
                return Err(ValidationError::IncompatibleSegment);
            }
        }
        Ok(())
    }

    /// Stems the selected model produces.
    pub fn stems(&self) -> &'static [Stem] {
        self.model.stems()
    }

    /// Name of the combined track in isolate mode.
    pub fn backing_track_name(&self) -> &'static str {
        if self.isolate_stem == Stem::Vocals {
            "instrumental"
        } else {
            "backing"
        }
    }
}
