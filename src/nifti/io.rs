//! NIfTI-1 reading and writing.
//!
//! - Memory-mapped reading for uncompressed files
//! - Single-pass libdeflate decompression with a streaming fallback for
//!   multi-member gzip
//! - Parallel gzip compression (gzp) for large outputs
//! - Write-once saves: an existing file is never overwritten

use super::header::NiftiHeader;
use super::image::{DeformationField, NiftiImage, VoxelSemantic};
use crate::error::{Error, Result};
use flate2::bufread::MultiGzDecoder;
use gzp::deflate::Gzip;
use gzp::par::compress::ParCompressBuilder;
use gzp::ZWriter;
use libdeflater::{DecompressionError, Decompressor};
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;

thread_local! {
    static DECOMPRESSOR: std::cell::RefCell<Decompressor> = std::cell::RefCell::new(Decompressor::new());
}

const GZIP_BUFFER_SIZE: usize = 256 * 1024;
const PARALLEL_THRESHOLD: usize = 1024 * 1024;

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn read_file_with_readahead(path: &Path) -> Result<Vec<u8>> {
    use std::os::unix::io::AsRawFd;

    let file = File::open(path)?;
    let len = file.metadata()?.len() as usize;

    // SAFETY: the descriptor is valid for the lifetime of `file`; fadvise is a hint only.
    unsafe {
        libc::posix_fadvise(
            file.as_raw_fd(),
            0,
            len as libc::off_t,
            libc::POSIX_FADV_SEQUENTIAL,
        );
    }

    let mut buffer = Vec::with_capacity(len);
    let mut reader = BufReader::with_capacity(GZIP_BUFFER_SIZE, file);
    reader.read_to_end(&mut buffer)?;
    Ok(buffer)
}

#[cfg(not(target_os = "linux"))]
fn read_file_with_readahead(path: &Path) -> Result<Vec<u8>> {
    Ok(std::fs::read(path)?)
}

fn is_gzipped(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "gz")
}

fn ensure_exists(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::not_found(path, "volume"))
    }
}

/// Load a NIfTI volume of any dimensionality as a continuous image.
///
/// Trailing singleton dimensions beyond the third are dropped, so a 4D file
/// with a single frame loads as 3D.
///
/// # Example
/// ```ignore
/// let img = roistat::nifti::load("zstat1.nii.gz")?;
/// ```
#[must_use = "this function returns a loaded image that should be used"]
pub fn load<P: AsRef<Path>>(path: P) -> Result<NiftiImage> {
    read_image(path.as_ref(), VoxelSemantic::Continuous)
}

/// Load a 3D volume and tag it with `semantic`.
#[must_use = "this function returns a loaded image that should be used"]
pub fn load_volume<P: AsRef<Path>>(path: P, semantic: VoxelSemantic) -> Result<NiftiImage> {
    let path = path.as_ref();
    let image = read_image(path, semantic)?;
    if image.ndim() != 3 {
        return Err(Error::InvalidFileFormat(format!(
            "{} is not a 3D scalar volume (shape {:?})",
            path.display(),
            image.shape()
        )));
    }
    Ok(image)
}

/// Load a binary mask (label semantics).
#[must_use = "this function returns a loaded image that should be used"]
pub fn load_mask<P: AsRef<Path>>(path: P) -> Result<NiftiImage> {
    load_volume(path, VoxelSemantic::Label)
}

/// Load a template→native deformation field.
#[must_use = "this function returns a loaded field that should be used"]
pub fn load_deformation<P: AsRef<Path>>(path: P) -> Result<DeformationField> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(Error::Transform {
            operation: "inverse warp to native",
            reason: format!("deformation field not found: {}", path.display()),
        });
    }
    DeformationField::new(read_image(path, VoxelSemantic::Continuous)?)
}

fn read_image(path: &Path, semantic: VoxelSemantic) -> Result<NiftiImage> {
    ensure_exists(path)?;
    debug!(path = %path.display(), "loading volume");
    if is_gzipped(path) {
        load_gzipped(path, semantic)
    } else {
        load_uncompressed(path, semantic)
    }
}

fn estimate_gzip_uncompressed_size(compressed: &[u8]) -> usize {
    // ISIZE per RFC 1952 is the input size modulo 2^32 of the last member.
    if compressed.len() >= 4 {
        let trailer = &compressed[compressed.len() - 4..];
        u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]) as usize
    } else {
        compressed.len() * 4
    }
}

fn decompress_gzip_streaming(compressed: &[u8]) -> Result<Vec<u8>> {
    let cursor = std::io::Cursor::new(compressed);
    let mut decoder = MultiGzDecoder::new(BufReader::with_capacity(GZIP_BUFFER_SIZE, cursor));

    let mut output = Vec::with_capacity(estimate_gzip_uncompressed_size(compressed));
    decoder
        .read_to_end(&mut output)
        .map_err(|e| Error::Decompression(format!("gzip stream decode failed: {e}")))?;
    Ok(output)
}

/// Single-shot libdeflate decode sized from the gzip trailer.
///
/// Returns `(bytes, used_streaming)`.
fn decompress_gzip_with_fallback(compressed: &[u8]) -> Result<(Vec<u8>, bool)> {
    let buffer_size = estimate_gzip_uncompressed_size(compressed).max(NiftiHeader::SIZE);
    let mut output = vec![0u8; buffer_size];

    let result = DECOMPRESSOR.with(|d| d.borrow_mut().gzip_decompress(compressed, &mut output));

    match result {
        Ok(written) => {
            output.truncate(written);
            Ok((output, false))
        }
        Err(DecompressionError::InsufficientSpace) => {
            drop(output);
            Ok((decompress_gzip_streaming(compressed)?, true))
        }
        Err(e) => {
            // The streaming decoder reports the definitive error for corrupt input.
            debug!(error = %e, "libdeflate rejected payload, retrying with streaming decoder");
            drop(output);
            Ok((decompress_gzip_streaming(compressed)?, true))
        }
    }
}

fn parse_payload(bytes: &[u8]) -> Result<(NiftiHeader, usize)> {
    let header = NiftiHeader::from_bytes(bytes)?;
    let offset = header.vox_offset as usize;
    let end = offset + header.data_size();
    if bytes.len() < end {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("file truncated: {} bytes, need {}", bytes.len(), end),
        )));
    }
    // Header extensions (between byte 352 and vox_offset) are skipped.
    Ok((header, offset))
}

#[allow(unsafe_code)]
fn load_uncompressed(path: &Path, semantic: VoxelSemantic) -> Result<NiftiImage> {
    let file = File::open(path)?;
    // SAFETY: read-only map of a file we just opened; outputs are never
    // rewritten in place, so the mapping stays consistent while decoding.
    let mmap = unsafe { Mmap::map(&file)? };

    let (header, offset) = parse_payload(&mmap)?;
    NiftiImage::from_bytes(header, &mmap[offset..], semantic)
}

/// Falls back to streaming decode when ISIZE is wrong (multi-member gzip
/// or payloads over 4 GiB).
fn load_gzipped(path: &Path, semantic: VoxelSemantic) -> Result<NiftiImage> {
    let compressed = read_file_with_readahead(path)?;
    let (mut output, used_streaming) = decompress_gzip_with_fallback(&compressed)?;

    let parsed = parse_payload(&output);
    let (header, offset) = match parsed {
        Ok(ok) => ok,
        Err(_) if !used_streaming => {
            output = decompress_gzip_streaming(&compressed)?;
            parse_payload(&output)?
        }
        Err(e) => return Err(e),
    };

    NiftiImage::from_bytes(header, &output[offset..], semantic)
}

/// Save a volume as `.nii` or `.nii.gz` (by extension).
///
/// Outputs are write-once: if `path` already exists this fails with an
/// [`std::io::ErrorKind::AlreadyExists`] I/O error and leaves it untouched.
///
/// # Example
/// ```ignore
/// roistat::nifti::save(&mask, "out/PMC_L_native.nii.gz")?;
/// ```
pub fn save<P: AsRef<Path>>(image: &NiftiImage, path: P) -> Result<()> {
    image.header().validate()?;

    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    debug!(path = %path.display(), "writing volume");

    if is_gzipped(path) {
        save_gzipped(image, file)
    } else {
        save_uncompressed(image, file)
    }
}

fn encode(image: &NiftiImage) -> Result<Vec<u8>> {
    let mut header = image.header().clone();
    header.vox_offset = 352;
    let data = image.data_to_bytes()?;

    let mut out = Vec::with_capacity(352 + data.len());
    out.extend_from_slice(&header.to_bytes());
    // Empty extension block.
    out.resize(352, 0u8);
    out.extend_from_slice(&data);
    Ok(out)
}

fn save_uncompressed(image: &NiftiImage, file: File) -> Result<()> {
    let mut writer = BufWriter::with_capacity(1024 * 1024, file);
    writer.write_all(&encode(image)?)?;
    writer.flush()?;
    Ok(())
}

fn save_gzipped(image: &NiftiImage, file: File) -> Result<()> {
    let uncompressed = encode(image)?;

    if uncompressed.len() >= PARALLEL_THRESHOLD {
        let writer = BufWriter::with_capacity(1024 * 1024, file);
        let mut parz = ParCompressBuilder::<Gzip>::new().from_writer(writer);
        parz.write_all(&uncompressed).map_err(|e| {
            Error::Io(std::io::Error::other(format!(
                "parallel compression failed: {e}"
            )))
        })?;
        parz.finish().map_err(|e| {
            Error::Io(std::io::Error::other(format!(
                "parallel compression finish failed: {e}"
            )))
        })?;
    } else {
        let mut compressor = libdeflater::Compressor::new(libdeflater::CompressionLvl::fastest());
        let mut compressed = vec![0u8; compressor.gzip_compress_bound(uncompressed.len())];
        let actual_size = compressor
            .gzip_compress(&uncompressed, &mut compressed)
            .map_err(|e| Error::Io(std::io::Error::other(format!("compression failed: {e:?}"))))?;
        compressed.truncate(actual_size);

        let mut writer = BufWriter::new(file);
        writer.write_all(&compressed)?;
        writer.flush()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nifti::image::Affine;
    use ndarray::{ArrayD, IxDyn, ShapeBuilder};
    use std::io::Write as _;
    use tempfile::tempdir;

    const AFFINE: Affine = [
        [-2.0, 0.0, 0.0, 90.0],
        [0.0, 2.0, 0.0, -126.0],
        [0.0, 0.0, 2.0, -72.0],
        [0.0, 0.0, 0.0, 1.0],
    ];

    fn create_test_image(shape: &[usize]) -> NiftiImage {
        let n: usize = shape.iter().product();
        let data = ArrayD::from_shape_vec(
            IxDyn(shape).f(),
            (0..n).map(|i| (i % 17) as f32 - 4.0).collect(),
        )
        .unwrap();
        NiftiImage::from_array(data, AFFINE)
    }

    #[test]
    fn test_roundtrip_uncompressed_and_gzipped() {
        let dir = tempdir().unwrap();
        let img = create_test_image(&[6, 7, 5]);

        for name in ["vol.nii", "vol.nii.gz"] {
            let path = dir.path().join(name);
            save(&img, &path).unwrap();
            let loaded = load_volume(&path, VoxelSemantic::Continuous).unwrap();
            assert_eq!(loaded.shape(), &[6, 7, 5]);
            assert!(loaded.same_grid(&img));
            assert_eq!(loaded.voxels().unwrap(), img.voxels().unwrap());
        }
    }

    #[test]
    fn test_save_refuses_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("once.nii.gz");
        let img = create_test_image(&[3, 3, 3]);
        save(&img, &path).unwrap();
        let before = std::fs::read(&path).unwrap();

        let err = save(&img, &path).unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists));
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_missing_file_names_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.nii.gz");
        let err = load(&path).unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));
        assert!(err.to_string().contains("absent.nii.gz"));
    }

    #[test]
    fn test_single_frame_4d_loads_as_3d() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.nii");
        save(&create_test_image(&[4, 4, 4, 1]), &path).unwrap();
        let loaded = load_volume(&path, VoxelSemantic::Continuous).unwrap();
        assert_eq!(loaded.shape(), &[4, 4, 4]);
    }

    #[test]
    fn test_multi_frame_rejected_as_volume() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("series.nii");
        save(&create_test_image(&[4, 4, 4, 2]), &path).unwrap();
        assert!(matches!(
            load_volume(&path, VoxelSemantic::Continuous),
            Err(Error::InvalidFileFormat(_))
        ));
        assert_eq!(load(&path).unwrap().shape(), &[4, 4, 4, 2]);
    }

    #[test]
    fn test_multi_member_gzip() {
        let dir = tempdir().unwrap();
        let img = create_test_image(&[5, 5, 5]);
        let raw = encode(&img).unwrap();
        let (first, second) = raw.split_at(raw.len() / 2);

        let path = dir.path().join("multi.nii.gz");
        let mut file = File::create(&path).unwrap();
        for part in [first, second] {
            let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
            enc.write_all(part).unwrap();
            file.write_all(&enc.finish().unwrap()).unwrap();
        }
        drop(file);

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.voxels().unwrap(), img.voxels().unwrap());
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.nii");
        let raw = encode(&create_test_image(&[4, 4, 4])).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 10]).unwrap();
        assert!(matches!(load(&path), Err(Error::Io(_))));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.nii");
        let mut raw = encode(&create_test_image(&[2, 2, 2])).unwrap();
        raw[344..348].copy_from_slice(b"xxxx");
        std::fs::write(&path, &raw).unwrap();
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("invalid NIfTI magic"));
    }
}
