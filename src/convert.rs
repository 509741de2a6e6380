//! Input conversion: volumes and masks into the MRC files the filter reads.

use crate::error::ConversionError;
use crate::mrc::Volume;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Strips a trailing format hint such as `:mrc` from an image location.
///
/// Upstream programs often record half-maps as `path/half1.mrc:mrc`; the
/// part after the last colon is only kept when it looks like a path.
///
/// # Examples
///
/// ```
/// use halfmap_filter::convert::image_path;
/// use std::path::PathBuf;
///
/// assert_eq!(image_path("run/half1.mrc:mrc"), PathBuf::from("run/half1.mrc"));
/// assert_eq!(image_path("run/half1.mrc"), PathBuf::from("run/half1.mrc"));
/// ```
pub fn image_path(location: &str) -> PathBuf {
    match location.rsplit_once(':') {
        Some((path, hint))
            if !path.is_empty()
                && !hint.is_empty()
                && hint.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            PathBuf::from(path)
        }
        _ => PathBuf::from(location),
    }
}

/// Clamps a mask value to `[0, 1]`. NaN becomes 0.
pub fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Copies `source` to `destination` as a float32 MRC file.
pub fn materialize_volume(source: &Path, destination: &Path) -> Result<(), ConversionError> {
    let volume = Volume::read(source)?;
    debug!(
        source = %source.display(),
        dims = ?volume.dims(),
        "Converting volume"
    );
    volume.write(destination)
}

/// Converts a mask for the filter: values clamped to `[0, 1]`, optionally
/// resampled to a cube of edge `target_dimension`.
///
/// `destination` may be a directory, in which case the file is named after
/// the source with an `.mrc` extension. Returns the path written.
pub fn materialize_mask(
    source: &Path,
    destination: &Path,
    target_dimension: Option<usize>,
) -> Result<PathBuf, ConversionError> {
    let out = if destination.is_dir() {
        let stem = source.file_stem().unwrap_or(source.as_os_str());
        destination.join(Path::new(stem).with_extension("mrc"))
    } else {
        destination.to_path_buf()
    };

    let mut mask = Volume::read(source)?;
    if let Some(target) = target_dimension {
        if mask.dims() != (target, target, target) {
            mask = resample_cubic(&mask, target).ok_or(ConversionError::DimensionMismatch {
                path: source.to_path_buf(),
                from: mask.dims(),
                to: target,
            })?;
            info!(
                source = %source.display(),
                dimension = target,
                "Resampled mask"
            );
        }
    }

    for v in mask.data_mut() {
        *v = clamp_unit(*v);
    }
    mask.write(&out)?;
    Ok(out)
}

/// Trilinear resize of a cubic volume to edge `dim`.
///
/// The physical box is preserved, so the voxel size scales by
/// `old_dim / dim`. Returns `None` for non-cubic input or `dim == 0`.
pub fn resample_cubic(volume: &Volume, dim: usize) -> Option<Volume> {
    let src = volume.cubic_dimension()?;
    if dim == 0 {
        return None;
    }
    if src == dim {
        return Some(volume.clone());
    }

    let scale = src as f32 / dim as f32;
    let axis: Vec<(usize, usize, f32)> = (0..dim)
        .map(|i| {
            let p = ((i as f32 + 0.5) * scale - 0.5).clamp(0.0, (src - 1) as f32);
            let lo = p.floor() as usize;
            let hi = (lo + 1).min(src - 1);
            (lo, hi, p - lo as f32)
        })
        .collect();

    let mut data = Vec::with_capacity(dim * dim * dim);
    for &(z0, z1, fz) in &axis {
        for &(y0, y1, fy) in &axis {
            for &(x0, x1, fx) in &axis {
                let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
                let c00 = lerp(volume.at(x0, y0, z0), volume.at(x1, y0, z0), fx);
                let c10 = lerp(volume.at(x0, y1, z0), volume.at(x1, y1, z0), fx);
                let c01 = lerp(volume.at(x0, y0, z1), volume.at(x1, y0, z1), fx);
                let c11 = lerp(volume.at(x0, y1, z1), volume.at(x1, y1, z1), fx);
                data.push(lerp(lerp(c00, c10, fy), lerp(c01, c11, fy), fz));
            }
        }
    }

    Volume::new((dim, dim, dim), volume.voxel_size() * scale, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_image_path_keeps_plain_paths() {
        assert_eq!(image_path("/data/map.mrc"), PathBuf::from("/data/map.mrc"));
        assert_eq!(image_path("map.mrc:"), PathBuf::from("map.mrc:"));
        assert_eq!(image_path("a:b/c.mrc"), PathBuf::from("a:b/c.mrc"));
    }

    #[test]
    fn test_mask_values_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("raw_mask.mrc");
        let data = vec![-2.0, 0.0, 0.25, 1.0, 3.5, f32::NAN, 0.75, 1.0001];
        Volume::new((2, 2, 2), 3.0, data).unwrap().write(&src).unwrap();

        let out = materialize_mask(&src, &dir.path().join("mask.mrc"), None).unwrap();
        let mask = Volume::read(&out).unwrap();
        assert_eq!(mask.data(), &[0.0, 0.0, 0.25, 1.0, 1.0, 0.0, 0.75, 1.0]);
    }

    #[test]
    fn test_mask_into_directory_uses_source_name() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("relion_mask.map");
        Volume::filled(4, 1.0, 2.0).write(&src).unwrap();
        let outdir = dir.path().join("extra");
        std::fs::create_dir(&outdir).unwrap();

        let out = materialize_mask(&src, &outdir, None).unwrap();
        assert_eq!(out, outdir.join("relion_mask.mrc"));
        assert!(Volume::read(&out).unwrap().data().iter().all(|v| *v == 1.0));
    }

    #[test]
    fn test_mask_resampled_to_volume_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("mask64.mrc");
        Volume::filled(64, 3.0, 1.0).write(&src).unwrap();

        let out = materialize_mask(&src, &dir.path().join("mask.mrc"), Some(60)).unwrap();
        let mask = Volume::read(&out).unwrap();
        assert_eq!(mask.dims(), (60, 60, 60));
        assert!((mask.voxel_size() - 3.2).abs() < 1e-4);
        assert!(mask.data().iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_non_cubic_mask_cannot_be_resampled() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("slab.mrc");
        Volume::new((4, 4, 2), 1.0, vec![0.5; 32])
            .unwrap()
            .write(&src)
            .unwrap();

        let err = materialize_mask(&src, &dir.path().join("mask.mrc"), Some(4)).unwrap_err();
        assert!(matches!(
            err,
            ConversionError::DimensionMismatch { from: (4, 4, 2), to: 4, .. }
        ));
    }

    #[test]
    fn test_resample_preserves_linear_ramp_endpoints() {
        let data: Vec<f32> = (0..4 * 4 * 4).map(|i| (i % 4) as f32).collect();
        let vol = Volume::new((4, 4, 4), 1.0, data).unwrap();
        let down = resample_cubic(&vol, 2).unwrap();
        assert_eq!(down.dims(), (2, 2, 2));
        assert!((down.at(0, 0, 0) - 0.5).abs() < 1e-6);
        assert!((down.at(1, 0, 0) - 2.5).abs() < 1e-6);
        assert!(resample_cubic(&vol, 0).is_none());
    }

    #[test]
    fn test_unreadable_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = materialize_volume(
            &dir.path().join("missing.mrc"),
            &dir.path().join("out.mrc"),
        )
        .unwrap_err();
        assert!(matches!(err, ConversionError::Unreadable { .. }));
    }

    #[test]
    fn test_unwritable_destination() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("half1.mrc");
        Volume::filled(2, 1.0, 0.0).write(&src).unwrap();
        let err = materialize_volume(&src, &dir.path().join("no/such/dir/out.mrc")).unwrap_err();
        assert!(matches!(err, ConversionError::Unwritable { .. }));
    }

    proptest! {
        #[test]
        fn clamp_is_idempotent_and_in_range(x in proptest::num::f32::ANY) {
            let once = clamp_unit(x);
            prop_assert!((0.0..=1.0).contains(&once));
            prop_assert_eq!(clamp_unit(once), once);
        }
    }
}
