//! Deterministic USTAR archive assembly.
//!
//! The final archive must be byte-identical to what the reference runtime
//! produces for the same image, which pins down every header field: POSIX
//! USTAR format with 512-byte records, entries in sorted name order, zeroed
//! ownership, fixed timestamps for the auxiliary files, and a checksum
//! written as six octal digits followed by a NUL and a space. Stock tar
//! writers disagree on the checksum terminator, so the headers are packed
//! here by hand.

use std::{
    fs::{self, File},
    io::{BufWriter, Read, Write},
    os::unix::fs::PermissionsExt,
    path::Path,
};

use walkdir::WalkDir;

use crate::{OcitarError, OcitarResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The record size of the archive.
const BLOCK_SIZE: usize = 512;

/// Entries whose modification time is pinned to the epoch.
const EPOCH_MTIME_NAMES: [&str; 2] = ["manifest.json", "repositories"];

const TYPE_REGULAR: u8 = b'0';
const TYPE_SYMLINK: u8 = b'2';
const TYPE_DIRECTORY: u8 = b'5';

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

struct EntryHeader<'a> {
    name: &'a str,
    mode: u32,
    size: u64,
    mtime: u64,
    typeflag: u8,
    linkname: &'a str,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Bundles a scratch directory tree into a USTAR archive at `out_path`.
///
/// Entries are written in ascending lexicographic order of their names
/// relative to `src_dir`, a directory entry preceding its contents.
/// `manifest.json` and `repositories` get mtime 0; every other entry gets
/// `created` (the image configuration timestamp as Unix seconds). Symbolic
/// links are stored as link entries, never dereferenced.
pub fn make_tar(out_path: &Path, src_dir: &Path, created: i64) -> OcitarResult<()> {
    let file = File::create(out_path)?;
    let mut writer = BufWriter::new(file);

    for entry in WalkDir::new(src_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| OcitarError::ArchiveError(e.to_string()))?;
        let name = entry
            .path()
            .strip_prefix(src_dir)
            .map_err(|e| OcitarError::ArchiveError(e.to_string()))?
            .to_str()
            .ok_or_else(|| {
                OcitarError::ArchiveError(format!(
                    "non-unicode entry name: {}",
                    entry.path().display()
                ))
            })?
            .to_string();

        append_entry(&mut writer, entry.path(), &name, created)?;
    }

    // two zero records terminate the archive
    writer.write_all(&[0u8; BLOCK_SIZE])?;
    writer.write_all(&[0u8; BLOCK_SIZE])?;
    writer.flush()?;

    Ok(())
}

fn append_entry(
    writer: &mut impl Write,
    path: &Path,
    name: &str,
    created: i64,
) -> OcitarResult<()> {
    let metadata = fs::symlink_metadata(path)?;
    let file_type = metadata.file_type();

    let mode = metadata.permissions().mode() & 0o7777;
    let mtime = if EPOCH_MTIME_NAMES.contains(&name) {
        0
    } else {
        created.max(0) as u64
    };

    if file_type.is_symlink() {
        let target = fs::read_link(path)?;
        let target = target.to_str().ok_or_else(|| {
            OcitarError::ArchiveError(format!("non-unicode link target: {}", path.display()))
        })?;

        write_header(
            writer,
            &EntryHeader {
                name,
                mode,
                size: 0,
                mtime,
                typeflag: TYPE_SYMLINK,
                linkname: target,
            },
        )?;
    } else if file_type.is_dir() {
        let name = format!("{}/", name);
        write_header(
            writer,
            &EntryHeader {
                name: &name,
                mode,
                size: 0,
                mtime,
                typeflag: TYPE_DIRECTORY,
                linkname: "",
            },
        )?;
    } else if file_type.is_file() {
        let size = metadata.len();
        write_header(
            writer,
            &EntryHeader {
                name,
                mode,
                size,
                mtime,
                typeflag: TYPE_REGULAR,
                linkname: "",
            },
        )?;
        append_file_data(writer, path, size)?;
    } else {
        return Err(OcitarError::ArchiveError(format!(
            "unsupported file type: {}",
            path.display()
        )));
    }

    Ok(())
}

fn append_file_data(writer: &mut impl Write, path: &Path, size: u64) -> OcitarResult<()> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; BLOCK_SIZE * 16];
    let mut copied: u64 = 0;

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read])?;
        copied += read as u64;
    }

    if copied != size {
        return Err(OcitarError::ArchiveError(format!(
            "{} changed while archiving ({} bytes read, {} expected)",
            path.display(),
            copied,
            size
        )));
    }

    let remainder = (size % BLOCK_SIZE as u64) as usize;
    if remainder != 0 {
        writer.write_all(&vec![0u8; BLOCK_SIZE - remainder])?;
    }

    Ok(())
}

/// Packs one 512-byte USTAR header.
fn write_header(writer: &mut impl Write, header: &EntryHeader<'_>) -> OcitarResult<()> {
    let mut block = [0u8; BLOCK_SIZE];

    write_name(&mut block[0..100], header.name)?;
    write_octal(&mut block[100..108], header.mode as u64)?;
    write_octal(&mut block[108..116], 0)?; // uid
    write_octal(&mut block[116..124], 0)?; // gid
    write_octal(&mut block[124..136], header.size)?;
    write_octal(&mut block[136..148], header.mtime)?;
    block[148..156].copy_from_slice(b"        "); // checksum placeholder
    block[156] = header.typeflag;
    write_name(&mut block[157..257], header.linkname)?;
    block[257..263].copy_from_slice(b"ustar\0");
    block[263..265].copy_from_slice(b"00");
    // uname, gname and prefix stay zeroed
    write_octal(&mut block[329..337], 0)?; // devmajor
    write_octal(&mut block[337..345], 0)?; // devminor

    // the checksum is the unsigned byte sum of the header with the checksum
    // field read as eight spaces, stored as six octal digits, NUL, space
    let sum: u32 = block.iter().map(|b| u32::from(*b)).sum();
    let checksum = format!("{:06o}\0 ", sum);
    block[148..156].copy_from_slice(checksum.as_bytes());

    writer.write_all(&block)?;

    Ok(())
}

fn write_name(field: &mut [u8], name: &str) -> OcitarResult<()> {
    let bytes = name.as_bytes();
    if bytes.len() > field.len() {
        return Err(OcitarError::ArchiveError(format!(
            "name does not fit in a ustar header field: {}",
            name
        )));
    }
    field[..bytes.len()].copy_from_slice(bytes);

    Ok(())
}

/// Writes a zero-padded octal number terminated by a NUL, the way the
/// reference encoder fills numeric header fields.
fn write_octal(field: &mut [u8], value: u64) -> OcitarResult<()> {
    let digits = field.len() - 1;
    let encoded = format!("{:0width$o}", value, width = digits);
    if encoded.len() > digits {
        return Err(OcitarError::ArchiveError(format!(
            "value {} does not fit in a {}-digit octal field",
            value, digits
        )));
    }
    field[..digits].copy_from_slice(encoded.as_bytes());
    field[digits] = 0;

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use super::*;

    const CREATED: i64 = 1691436020;

    fn build_scratch(root: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(root.join("aaa111"))?;
        fs::write(root.join("aaa111/VERSION"), "1.0")?;
        fs::write(root.join("aaa111/json"), "{}")?;
        fs::write(root.join("aaa111/layer.tar"), vec![7u8; 700])?;

        fs::create_dir_all(root.join("bbb222"))?;
        fs::write(root.join("bbb222/VERSION"), "1.0")?;
        fs::write(root.join("bbb222/json"), "{}")?;
        symlink("../aaa111/layer.tar", root.join("bbb222/layer.tar"))?;

        fs::write(root.join("0123abcd.json"), "{\"os\":\"linux\"}")?;
        fs::write(root.join("manifest.json"), "[]\n")?;
        fs::write(root.join("repositories"), "{}\n")?;

        Ok(())
    }

    #[test]
    fn test_make_tar_member_order_and_kinds() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch)?;
        build_scratch(&scratch)?;

        let out = dir.path().join("image.tar");
        make_tar(&out, &scratch, CREATED)?;

        let mut archive = tar::Archive::new(File::open(&out)?);
        let mut names = Vec::new();
        let mut kinds = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            names.push(entry.path()?.to_string_lossy().to_string());
            kinds.push(entry.header().entry_type());
        }

        assert_eq!(
            names,
            vec![
                "0123abcd.json",
                "aaa111/",
                "aaa111/VERSION",
                "aaa111/json",
                "aaa111/layer.tar",
                "bbb222/",
                "bbb222/VERSION",
                "bbb222/json",
                "bbb222/layer.tar",
                "manifest.json",
                "repositories",
            ]
        );
        assert_eq!(kinds[1], tar::EntryType::Directory);
        assert_eq!(kinds[8], tar::EntryType::Symlink);

        Ok(())
    }

    #[test]
    fn test_make_tar_symlink_is_not_dereferenced() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch)?;
        build_scratch(&scratch)?;

        let out = dir.path().join("image.tar");
        make_tar(&out, &scratch, CREATED)?;

        let mut archive = tar::Archive::new(File::open(&out)?);
        let entry = archive
            .entries()?
            .map(|e| e.unwrap())
            .find(|e| e.path().unwrap().to_string_lossy() == "bbb222/layer.tar")
            .unwrap();

        assert_eq!(entry.header().entry_type(), tar::EntryType::Symlink);
        assert_eq!(
            entry.link_name().unwrap().unwrap().to_string_lossy(),
            "../aaa111/layer.tar"
        );
        assert_eq!(entry.header().size().unwrap(), 0);

        Ok(())
    }

    #[test]
    fn test_make_tar_ownership_and_mtimes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch)?;
        build_scratch(&scratch)?;

        let out = dir.path().join("image.tar");
        make_tar(&out, &scratch, CREATED)?;

        let mut archive = tar::Archive::new(File::open(&out)?);
        for entry in archive.entries()? {
            let entry = entry?;
            let header = entry.header();
            let name = entry.path()?.to_string_lossy().to_string();

            assert_eq!(header.uid()?, 0, "{name}");
            assert_eq!(header.gid()?, 0, "{name}");
            assert_eq!(header.username().unwrap(), Some(""), "{name}");

            let expected = if name == "manifest.json" || name == "repositories" {
                0
            } else {
                CREATED as u64
            };
            assert_eq!(header.mtime()?, expected, "{name}");
        }

        Ok(())
    }

    #[test]
    fn test_header_bytes_magic_and_checksum_form() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch)?;
        fs::write(scratch.join("manifest.json"), "[]\n")?;

        let out = dir.path().join("image.tar");
        make_tar(&out, &scratch, CREATED)?;

        let bytes = fs::read(&out)?;
        assert_eq!(bytes.len() % BLOCK_SIZE, 0);
        // header, one data block, two terminating zero blocks
        assert_eq!(bytes.len(), 4 * BLOCK_SIZE);

        let header = &bytes[..BLOCK_SIZE];
        assert_eq!(&header[257..263], b"ustar\0");
        assert_eq!(&header[263..265], b"00");

        // checksum: six octal digits, NUL, space
        let checksum_field = &header[148..156];
        assert!(checksum_field[..6].iter().all(|b| (b'0'..=b'7').contains(b)));
        assert_eq!(checksum_field[6], 0);
        assert_eq!(checksum_field[7], b' ');

        // recompute with the field blanked to spaces
        let mut copy = header.to_vec();
        copy[148..156].copy_from_slice(b"        ");
        let sum: u32 = copy.iter().map(|b| u32::from(*b)).sum();
        let stored =
            u32::from_str_radix(std::str::from_utf8(&checksum_field[..6]).unwrap(), 8).unwrap();
        assert_eq!(sum, stored);

        Ok(())
    }

    #[test]
    fn test_make_tar_mode_is_masked_from_disk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch)?;
        let file = scratch.join("blob");
        fs::write(&file, "x")?;
        fs::set_permissions(&file, fs::Permissions::from_mode(0o754))?;

        let out = dir.path().join("image.tar");
        make_tar(&out, &scratch, CREATED)?;

        let mut archive = tar::Archive::new(File::open(&out)?);
        let entry = archive.entries()?.next().unwrap()?;
        assert_eq!(entry.header().mode()?, 0o754);

        Ok(())
    }

    #[test]
    fn test_make_tar_is_deterministic() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch)?;
        build_scratch(&scratch)?;

        let first = dir.path().join("first.tar");
        let second = dir.path().join("second.tar");
        make_tar(&first, &scratch, CREATED)?;
        make_tar(&second, &scratch, CREATED)?;

        assert_eq!(fs::read(&first)?, fs::read(&second)?);

        Ok(())
    }
}
