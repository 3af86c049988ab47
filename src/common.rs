use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::num::NonZeroU32;

pub type DimSize = NonZeroU32;
pub type Shape = Vec<DimSize>;

/// How a tensor's scalars are packed into texture pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum ChannelMode {
    /// One scalar per pixel, stored in the red channel.
    R,
    /// Four scalars packed into one pixel.
    Rgba,
}

impl ChannelMode {
    pub fn scalars_per_pixel(&self) -> u8 {
        match self {
            ChannelMode::R => 1,
            ChannelMode::Rgba => 4,
        }
    }
}

impl Display for ChannelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelMode::R => write!(f, "R"),
            ChannelMode::Rgba => write!(f, "RGBA"),
        }
    }
}

/// Number of elements described by a shape. The empty shape has volume 1.
pub fn volume(shape: &[DimSize]) -> usize {
    shape.iter().map(|d| d.get() as usize).product()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nonzero::nonzero as nz;

    #[test]
    fn test_volume() {
        assert_eq!(volume(&[]), 1);
        assert_eq!(volume(&[nz!(3u32), nz!(4u32)]), 12);
    }

    #[test]
    fn test_channel_mode_display() {
        assert_eq!(ChannelMode::R.to_string(), "R");
        assert_eq!(ChannelMode::Rgba.to_string(), "RGBA");
    }
}
