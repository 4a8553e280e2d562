//! Fixed still-image faces.
//!
//! A test source directory holds one JPEG per cube face plus a sidecar file with the
//! face's layout metadata:
//!
//! ```text
//! negx.jpg negx_layout.txt   -> left
//! posx.jpg posx_layout.txt   -> front
//! negy.jpg negy_layout.txt   -> down
//! posy.jpg posy_layout.txt   -> back
//! negz.jpg negz_layout.txt   -> up
//! posz.jpg posz_layout.txt   -> right
//! ```
//!
//! Faces missing either file are skipped. Pixels are decoded once and kept as packed
//! BGRA; they are uploaded again on every view refresh.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::discovery::StreamDescriptor;
use crate::frame::Frame;
use crate::Face;

const FACE_FILES: [(&str, Face); 6] = [
    ("negx", Face::Left),
    ("posx", Face::Front),
    ("negy", Face::Down),
    ("posy", Face::Back),
    ("negz", Face::Up),
    ("posz", Face::Right),
];

/// One decoded still face.
#[derive(Clone, Debug)]
pub struct FixedFace {
    pub descriptor: StreamDescriptor,
    pub still: Frame,
}

/// Load every complete face found in `dir`, in cube-face order.
pub fn load_fixed_faces(dir: &Path) -> Result<Vec<FixedFace>> {
    if !dir.is_dir() {
        anyhow::bail!("fixed image directory {} does not exist", dir.display());
    }

    let mut faces = Vec::new();
    for (name, face) in FACE_FILES {
        let image_path = dir.join(format!("{name}.jpg"));
        let layout_path = dir.join(format!("{name}_layout.txt"));
        if !image_path.is_file() || !layout_path.is_file() {
            continue;
        }

        let layout_metadata = fs::read_to_string(&layout_path)
            .with_context(|| format!("read {}", layout_path.display()))?;
        let image = image::open(&image_path)
            .with_context(|| format!("decode {}", image_path.display()))?
            .to_rgba8();
        let (width, height) = image.dimensions();

        faces.push(FixedFace {
            descriptor: StreamDescriptor {
                face,
                endpoint: image_path.display().to_string(),
                layout_metadata,
                width,
                height,
            },
            still: Frame::packed_bgra(rgba_to_bgra(image.into_raw())),
        });
        log::info!("loaded fixed face {} ({}x{})", face, width, height);
    }
    Ok(faces)
}

fn rgba_to_bgra(mut pixels: Vec<u8>) -> Vec<u8> {
    for px in pixels.chunks_exact_mut(4) {
        px.swap(0, 2);
    }
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_face(dir: &Path, name: &str, width: u32, height: u32) {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 10, 30]));
        img.save(dir.join(format!("{name}.jpg"))).unwrap();
        fs::write(dir.join(format!("{name}_layout.txt")), format!("layout-{name}")).unwrap();
    }

    #[test]
    fn loads_complete_faces_in_cube_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_face(dir.path(), "posz", 16, 8);
        write_face(dir.path(), "negx", 16, 8);
        // image without layout sidecar is skipped
        RgbImage::new(4, 4).save(dir.path().join("posy.jpg"))?;

        let faces = load_fixed_faces(dir.path())?;
        let ids: Vec<Face> = faces.iter().map(|f| f.descriptor.face).collect();
        assert_eq!(ids, vec![Face::Left, Face::Right]);
        assert_eq!(faces[0].descriptor.layout_metadata, "layout-negx");
        assert_eq!(faces[0].still.sizes(), [16 * 8 * 4, 0, 0]);
        Ok(())
    }

    #[test]
    fn missing_directory_is_an_error() {
        assert!(load_fixed_faces(Path::new("/nonexistent/panoview-fixed")).is_err());
    }

    #[test]
    fn bgra_swaps_red_and_blue() {
        assert_eq!(rgba_to_bgra(vec![1, 2, 3, 4]), vec![3, 2, 1, 4]);
    }
}
