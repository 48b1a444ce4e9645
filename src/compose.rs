use crate::codec::PixelBuffer;
use image::imageops::{self, FilterType};
use image::Rgba;
use thiserror::Error;

/// Logo width as a fraction of the mockup width.
pub const LOGO_WIDTH_RATIO: f64 = 0.30;
pub const MAX_SCALED_DIMENSION: u32 = 16_384;
const RESAMPLE_FILTER: FilterType = FilterType::Triangle;

#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("source image has zero width or height")]
    EmptySource,
    #[error("scaled logo {width}x{height} exceeds limits")]
    ScaledLogoTooLarge { width: u64, height: u64 },
    #[error("composite worker failed")]
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogoPlacement {
    pub width: u32,
    pub height: u32,
    pub x: i64,
    pub y: i64,
}

impl LogoPlacement {
    /// Scales the logo to 30% of the mockup width, keeping its aspect ratio, and
    /// centers it. Offsets derive from the rounded size so both stay consistent.
    pub fn for_sizes(
        mockup: (u32, u32),
        logo: (u32, u32),
    ) -> Result<Self, CompositeError> {
        let (mockup_width, mockup_height) = mockup;
        let (logo_width, logo_height) = logo;
        if mockup_width == 0 || mockup_height == 0 || logo_width == 0 || logo_height == 0 {
            return Err(CompositeError::EmptySource);
        }
        let scaled_width = mockup_width as f64 * LOGO_WIDTH_RATIO;
        let scaled_height = logo_height as f64 * (scaled_width / logo_width as f64);
        let width = (scaled_width.round() as u64).max(1);
        let height = (scaled_height.round() as u64).max(1);
        if width > MAX_SCALED_DIMENSION as u64 || height > MAX_SCALED_DIMENSION as u64 {
            return Err(CompositeError::ScaledLogoTooLarge { width, height });
        }
        let x = (mockup_width as i64 - width as i64).div_euclid(2);
        let y = (mockup_height as i64 - height as i64).div_euclid(2);
        Ok(Self {
            width: width as u32,
            height: height as u32,
            x,
            y,
        })
    }
}

pub fn compose(mockup: &PixelBuffer, logo: &PixelBuffer) -> Result<PixelBuffer, CompositeError> {
    let (width, height) = mockup.dimensions();
    let placement = LogoPlacement::for_sizes((width, height), logo.dimensions())?;

    let mut canvas = PixelBuffer::from_pixel(width, height, Rgba([0, 0, 0, 0]));
    // Mockup pixels replace the transparent canvas outright.
    let base = resample(mockup, width, height);
    imageops::replace(&mut canvas, &base, 0, 0);

    let scaled_logo = resample(logo, placement.width, placement.height);
    imageops::overlay(&mut canvas, &scaled_logo, placement.x, placement.y);
    Ok(canvas)
}

fn resample(image: &PixelBuffer, width: u32, height: u32) -> PixelBuffer {
    imageops::resize(image, width, height, RESAMPLE_FILTER)
}
