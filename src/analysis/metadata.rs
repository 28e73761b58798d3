const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
const INCHES_PER_METER: f64 = 0.0254;
const CM_PER_INCH: f64 = 2.54;

/// Reads the declared print density from PNG `pHYs` or JPEG JFIF headers.
/// Returns `None` when the container declares no absolute density.
pub fn read_dpi(bytes: &[u8]) -> Option<f64> {
    if bytes.starts_with(&PNG_SIGNATURE) {
        return read_png_dpi(bytes);
    }
    if bytes.starts_with(&[0xff, 0xd8]) {
        return read_jfif_dpi(bytes);
    }
    None
}

fn read_png_dpi(bytes: &[u8]) -> Option<f64> {
    let mut offset = PNG_SIGNATURE.len();
    while offset + 8 <= bytes.len() {
        let len = u32::from_be_bytes(bytes[offset..offset + 4].try_into().ok()?) as usize;
        let kind = &bytes[offset + 4..offset + 8];
        let data_start = offset + 8;
        let data_end = data_start.checked_add(len)?;
        if data_end > bytes.len() {
            return None;
        }
        match kind {
            b"pHYs" if len >= 9 => {
                let data = &bytes[data_start..data_end];
                let x_ppu = u32::from_be_bytes(data[0..4].try_into().ok()?);
                let y_ppu = u32::from_be_bytes(data[4..8].try_into().ok()?);
                // unit 1 = meter; 0 only gives an aspect ratio
                if data[8] != 1 || x_ppu == 0 {
                    return None;
                }
                let ppu = f64::from(if y_ppu > 0 { x_ppu.min(y_ppu) } else { x_ppu });
                return Some(round_dpi(ppu * INCHES_PER_METER));
            }
            b"IDAT" | b"IEND" => return None,
            _ => {}
        }
        // chunk data + crc
        offset = data_end + 4;
    }
    None
}

fn read_jfif_dpi(bytes: &[u8]) -> Option<f64> {
    let mut offset = 2;
    while offset + 4 <= bytes.len() {
        if bytes[offset] != 0xff {
            return None;
        }
        let marker = bytes[offset + 1];
        let len = usize::from(u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]));
        let seg_start = offset + 4;
        let seg_end = (offset + 2).checked_add(len)?;
        if seg_end > bytes.len() || len < 2 {
            return None;
        }
        if marker == 0xe0 {
            let seg = &bytes[seg_start..seg_end];
            if seg.len() >= 12 && seg.starts_with(b"JFIF\0") {
                let units = seg[7];
                let x_density = f64::from(u16::from_be_bytes([seg[8], seg[9]]));
                if x_density <= 0.0 {
                    return None;
                }
                return match units {
                    1 => Some(x_density),
                    2 => Some(round_dpi(x_density * CM_PER_INCH)),
                    _ => None,
                };
            }
        }
        // start of scan; no more headers
        if marker == 0xda {
            return None;
        }
        offset = seg_end;
    }
    None
}

fn round_dpi(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
