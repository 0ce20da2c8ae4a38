use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Visual state of a tap.
///
/// The declaration order is the classifier's evaluation order and decides
/// exact score ties in favor of the earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TapState {
    Closed,
    Pouring,
    Foam,
}

impl TapState {
    pub const ALL: [TapState; 3] = [TapState::Closed, TapState::Pouring, TapState::Foam];

    /// Label used in reference file names written by the calibration tool.
    pub fn file_key(&self) -> &'static str {
        match self {
            TapState::Closed => "closed",
            TapState::Pouring => "beer",
            TapState::Foam => "foam",
        }
    }

    pub fn is_pouring(&self) -> bool {
        matches!(self, TapState::Pouring)
    }

    /// Anything but `Closed` counts as visible activity for the sampler.
    pub fn is_active(&self) -> bool {
        !matches!(self, TapState::Closed)
    }
}

impl fmt::Display for TapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TapState::Closed => "closed",
            TapState::Pouring => "pouring",
            TapState::Foam => "foam",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TapId {
    A,
    B,
}

impl TapId {
    pub fn as_str(&self) -> &'static str {
        match self {
            TapId::A => "A",
            TapId::B => "B",
        }
    }
}

impl fmt::Display for TapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One grayscale template per [`TapState`], held in evaluation order.
#[derive(Debug, Clone)]
pub struct ReferenceSet {
    templates: Vec<(TapState, GrayImage)>,
}

impl ReferenceSet {
    pub fn new(closed: GrayImage, pouring: GrayImage, foam: GrayImage) -> Self {
        Self {
            templates: vec![
                (TapState::Closed, closed),
                (TapState::Pouring, pouring),
                (TapState::Foam, foam),
            ],
        }
    }

    /// Loads `<tap>_<label>.jpg` for every state from `refs_dir`.
    ///
    /// A missing or undecodable file is replaced by a black template of
    /// `dimensions`, so loading never fails.
    pub fn load(refs_dir: impl AsRef<Path>, tap: TapId, dimensions: (u32, u32)) -> Self {
        let refs_dir = refs_dir.as_ref();
        let templates = TapState::ALL
            .iter()
            .map(|&state| {
                let path = Self::reference_path(refs_dir, tap, state);
                (state, Self::load_template(&path, dimensions))
            })
            .collect();
        Self { templates }
    }

    pub fn reference_path(refs_dir: impl AsRef<Path>, tap: TapId, state: TapState) -> PathBuf {
        refs_dir
            .as_ref()
            .join(format!("{}_{}.jpg", tap.as_str(), state.file_key()))
    }

    fn load_template(path: &Path, (width, height): (u32, u32)) -> GrayImage {
        if !path.exists() {
            warn!(
                "⚠️  [refs] missing reference {}, using a {}x{} blank template",
                path.display(),
                width,
                height
            );
            return GrayImage::new(width, height);
        }

        let decoded = image::io::Reader::open(path)
            .and_then(|reader| reader.with_guessed_format())
            .map_err(image::ImageError::IoError)
            .and_then(|reader| reader.decode());

        match decoded {
            Ok(img) => {
                debug!("[refs] loaded {} ({}x{})", path.display(), img.width(), img.height());
                img.to_luma8()
            }
            Err(e) => {
                warn!(
                    "⚠️  [refs] unreadable reference {}: {}, using a blank template",
                    path.display(),
                    e
                );
                GrayImage::new(width, height)
            }
        }
    }

    pub fn get(&self, state: TapState) -> Option<&GrayImage> {
        self.templates
            .iter()
            .find(|(s, _)| *s == state)
            .map(|(_, img)| img)
    }

    pub fn matches_dimensions(&self, dimensions: (u32, u32)) -> bool {
        self.templates.iter().all(|(_, img)| img.dimensions() == dimensions)
    }

    /// Copy with every template resized (bilinear) to `dimensions`.
    ///
    /// Empty templates stay empty so the classifier keeps skipping them.
    pub fn fitted_to(&self, (width, height): (u32, u32)) -> Self {
        if width == 0 || height == 0 {
            // a zero-area region never reaches the comparison
            return self.clone();
        }
        let templates = self
            .templates
            .iter()
            .map(|(state, img)| {
                let fitted = if img.dimensions() == (width, height)
                    || img.width() == 0
                    || img.height() == 0
                {
                    img.clone()
                } else {
                    imageops::resize(img, width, height, FilterType::Triangle)
                };
                (*state, fitted)
            })
            .collect();
        Self { templates }
    }

    /// Templates in evaluation order.
    pub fn iter(&self) -> impl Iterator<Item = (TapState, &GrayImage)> {
        self.templates.iter().map(|(state, img)| (*state, img))
    }
}
