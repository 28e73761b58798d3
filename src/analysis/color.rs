use serde::{Deserialize, Serialize};

/// Euclidean distance between black and white in RGB space.
pub const MAX_RGB_DISTANCE: f64 = 441.672_955_930_063_7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Accepts `#rrggbb`, `rrggbb`, `#rgb` and `rgb` (case-insensitive).
    pub fn from_hex(value: &str) -> Option<Self> {
        let raw = value.trim();
        let raw = raw.strip_prefix('#').unwrap_or(raw);
        if !raw.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return None;
        }
        match raw.len() {
            6 => Some(Self {
                r: u8::from_str_radix(&raw[0..2], 16).ok()?,
                g: u8::from_str_radix(&raw[2..4], 16).ok()?,
                b: u8::from_str_radix(&raw[4..6], 16).ok()?,
            }),
            3 => {
                let expand = |idx: usize| -> Option<u8> {
                    let nibble = u8::from_str_radix(&raw[idx..idx + 1], 16).ok()?;
                    Some(nibble * 17)
                };
                Some(Self {
                    r: expand(0)?,
                    g: expand(1)?,
                    b: expand(2)?,
                })
            }
            _ => None,
        }
    }

    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    pub fn distance(self, other: Self) -> f64 {
        let dr = f64::from(self.r) - f64::from(other.r);
        let dg = f64::from(self.g) - f64::from(other.g);
        let db = f64::from(self.b) - f64::from(other.b);
        (dr * dr + dg * dg + db * db).sqrt()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DominantColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub hex: String,
    /// Share of all image pixels (0.0..=1.0), transparent pixels included in the total.
    pub pixel_fraction: f64,
}

impl DominantColor {
    pub fn new(rgb: Rgb, pixel_fraction: f64) -> Self {
        Self {
            r: rgb.r,
            g: rgb.g,
            b: rgb.b,
            hex: rgb.to_hex(),
            pixel_fraction,
        }
    }

    pub fn rgb(&self) -> Rgb {
        Rgb::new(self.r, self.g, self.b)
    }
}

/// Closest dominant color to `target`, ties resolved by palette order.
pub fn nearest_color(colors: &[DominantColor], target: Rgb) -> Option<(&DominantColor, f64)> {
    let mut best: Option<(&DominantColor, f64)> = None;
    for color in colors {
        let distance = color.rgb().distance(target);
        match best {
            Some((_, current)) if current <= distance => {}
            _ => best = Some((color, distance)),
        }
    }
    best
}

/// Maps a 0-100 tolerance onto an RGB distance radius.
pub fn tolerance_radius(tolerance: f64) -> f64 {
    tolerance.clamp(0.0, 100.0) / 100.0 * MAX_RGB_DISTANCE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_long_and_short_hex() {
        assert_eq!(Rgb::from_hex("#FF8000"), Some(Rgb::new(255, 128, 0)));
        assert_eq!(Rgb::from_hex("00ff00"), Some(Rgb::new(0, 255, 0)));
        assert_eq!(Rgb::from_hex("#0af"), Some(Rgb::new(0, 170, 255)));
        assert_eq!(Rgb::from_hex("#12345"), None);
        assert_eq!(Rgb::from_hex("#gg0000"), None);
        assert_eq!(Rgb::from_hex("+1+2+3"), None);
    }

    #[test]
    fn formats_lowercase_hex() {
        assert_eq!(Rgb::new(171, 205, 239).to_hex(), "#abcdef");
    }

    #[test]
    fn distance_is_euclidean() {
        assert_eq!(Rgb::new(0, 0, 0).distance(Rgb::new(30, 0, 0)), 30.0);
        assert_eq!(Rgb::new(0, 0, 0).distance(Rgb::new(3, 4, 0)), 5.0);
        let max = Rgb::new(0, 0, 0).distance(Rgb::new(255, 255, 255));
        assert!((max - MAX_RGB_DISTANCE).abs() < 1e-9);
    }

    #[test]
    fn nearest_color_prefers_first_on_ties() {
        let palette = vec![
            DominantColor::new(Rgb::new(10, 0, 0), 0.5),
            DominantColor::new(Rgb::new(0, 10, 0), 0.5),
        ];
        let (color, distance) =
            nearest_color(&palette, Rgb::new(0, 0, 0)).expect("palette is not empty");
        assert_eq!(color.hex, "#0a0000");
        assert_eq!(distance, 10.0);
        assert!(nearest_color(&[], Rgb::new(0, 0, 0)).is_none());
    }
}
