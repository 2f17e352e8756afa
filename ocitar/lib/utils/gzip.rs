use std::{
    fs::{self, File},
    io::{BufReader, Read, Seek, SeekFrom, Write},
    path::Path,
};

use flate2::read::GzDecoder;

use crate::{progress::PullProgress, OcitarResult};

use super::FILE_CHUNK_SIZE;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Streams the gzip file at `src` into a decompressed file at `dest` and
/// removes `src` afterwards.
///
/// The uncompressed size is read from the trailing 4-byte little-endian
/// `ISIZE` field of the gzip stream and used only to size the progress bar;
/// the field wraps at 2^32 and is misleading for payloads of 4 GiB or more.
///
/// The function blocks; run it on a blocking thread from async contexts.
pub fn gunzip_file(src: &Path, dest: &Path, progress: &dyn PullProgress) -> OcitarResult<()> {
    let mut file = File::open(src)?;

    let mut isize = [0u8; 4];
    file.seek(SeekFrom::End(-4))?;
    file.read_exact(&mut isize)?;
    file.seek(SeekFrom::Start(0))?;
    progress.set_size(u32::from_le_bytes(isize) as u64);

    let mut decoder = GzDecoder::new(BufReader::new(file));
    let mut out = File::create(dest)?;
    let mut buffer = vec![0u8; FILE_CHUNK_SIZE];
    let mut done: u64 = 0;

    loop {
        let read = decoder.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        out.write_all(&buffer[..read])?;
        done += read as u64;
        progress.write(done);
    }
    out.flush()?;

    fs::remove_file(src)?;

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
