//! Paper formats, margins and page sizing.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, Stage};

/// PostScript points per inch.
pub const PT_PER_INCH: f64 = 72.0;

/// Supported paper formats: ISO 216 A-series plus the common ANSI sizes.
///
/// A closed set with a mandatory default, so an export request can never
/// name a format the pipeline does not know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PaperFormat {
    A3,
    #[default]
    A4,
    A5,
    Letter,
    Legal,
    Tabloid,
}

impl PaperFormat {
    /// Portrait dimensions in points.
    pub fn dimensions(self) -> PaperSpec {
        match self {
            PaperFormat::A3 => PaperSpec::new(841.89, 1190.55),
            PaperFormat::A4 => PaperSpec::new(595.28, 841.89),
            PaperFormat::A5 => PaperSpec::new(419.53, 595.28),
            PaperFormat::Letter => PaperSpec::new(612.0, 792.0),
            PaperFormat::Legal => PaperSpec::new(612.0, 1008.0),
            PaperFormat::Tabloid => PaperSpec::new(792.0, 1224.0),
        }
    }
}

/// Page orientation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Portrait,
    Landscape,
}

/// Physical page size in points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PaperSpec {
    pub width_pt: f64,
    pub height_pt: f64,
}

impl PaperSpec {
    pub fn new(width_pt: f64, height_pt: f64) -> Self {
        Self { width_pt, height_pt }
    }

    /// The spec with its longer edge horizontal for landscape.
    pub fn oriented(self, orientation: Orientation) -> PaperSpec {
        match orientation {
            Orientation::Portrait => self,
            Orientation::Landscape => PaperSpec::new(self.height_pt, self.width_pt),
        }
    }
}

/// Page margins in points. Each margin must stay below half the
/// corresponding paper dimension, otherwise no printable area remains.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarginsPt {
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub left: f64,
}

impl MarginsPt {
    pub fn uniform(value: f64) -> Self {
        Self {
            top: value,
            right: value,
            bottom: value,
            left: value,
        }
    }

    fn validate(&self, paper: &PaperSpec) -> Result<()> {
        let pairs = [
            ("top", self.top, paper.height_pt),
            ("bottom", self.bottom, paper.height_pt),
            ("left", self.left, paper.width_pt),
            ("right", self.right, paper.width_pt),
        ];
        for (name, margin, dim) in pairs {
            if margin < 0.0 || !margin.is_finite() {
                return Err(Error::at(
                    Stage::Paper,
                    format!("{} margin {}pt is not a valid length", name, margin),
                ));
            }
            if margin >= dim / 2.0 {
                return Err(Error::at(
                    Stage::Paper,
                    format!("{} margin {}pt exceeds half the page dimension {}pt", name, margin, dim),
                ));
            }
        }
        Ok(())
    }
}

impl Default for MarginsPt {
    fn default() -> Self {
        // Half an inch all around
        MarginsPt::uniform(36.0)
    }
}

/// Region of the page the map raster occupies, in points, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlacementBox {
    pub x_pt: f64,
    pub y_pt: f64,
    pub width_pt: f64,
    pub height_pt: f64,
}

/// How the export target is sized: through a paper format at a print
/// resolution, or with an explicit pixel viewport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PageSetup {
    Paper {
        format: PaperFormat,
        orientation: Orientation,
        margins: MarginsPt,
        dpi: u32,
    },
    Pixels {
        width: u32,
        height: u32,
    },
}

/// Resolved page parameters handed to the downstream stages.
#[derive(Debug, Clone)]
pub struct ResolvedPage {
    pub paper: Option<PaperSpec>,
    pub orientation: Orientation,
    pub placement: Option<PlacementBox>,
    pub dpi: u32,
    pub viewport_px: (u32, u32),
}

/// Convert a length in points to output pixels at the given resolution.
pub fn pt_to_px(pt: f64, dpi: u32) -> u32 {
    (pt / PT_PER_INCH * f64::from(dpi)).round() as u32
}

impl PageSetup {
    /// Resolve the setup into concrete page parameters.
    pub fn resolve(&self) -> Result<ResolvedPage> {
        match self {
            PageSetup::Paper {
                format,
                orientation,
                margins,
                dpi,
            } => {
                if *dpi == 0 {
                    return Err(Error::at(Stage::Paper, "dpi must be positive"));
                }
                let spec = format.dimensions().oriented(*orientation);
                margins.validate(&spec)?;
                let placement = PlacementBox {
                    x_pt: margins.left,
                    y_pt: margins.top,
                    width_pt: spec.width_pt - margins.left - margins.right,
                    height_pt: spec.height_pt - margins.top - margins.bottom,
                };
                let viewport = (
                    pt_to_px(placement.width_pt, *dpi),
                    pt_to_px(placement.height_pt, *dpi),
                );
                if viewport.0 == 0 || viewport.1 == 0 {
                    return Err(Error::at(
                        Stage::Paper,
                        "placement box leaves no printable pixels",
                    ));
                }
                Ok(ResolvedPage {
                    paper: Some(spec),
                    orientation: *orientation,
                    placement: Some(placement),
                    dpi: *dpi,
                    viewport_px: viewport,
                })
            }
            PageSetup::Pixels { width, height } => {
                if *width == 0 || *height == 0 {
                    return Err(Error::at(
                        Stage::Paper,
                        format!("viewport {}x{} has no area", width, height),
                    ));
                }
                Ok(ResolvedPage {
                    paper: None,
                    orientation: Orientation::Portrait,
                    placement: None,
                    dpi: 96,
                    viewport_px: (*width, *height),
                })
            }
        }
    }
}
