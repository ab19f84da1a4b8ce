use anyhow::{anyhow, bail, Context, Result};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Where the PCM payload of a RIFF/WAVE file sits, plus its format block.
struct WavLayout {
    fmt: Vec<u8>,
    data_offset: u64,
    data_len: u32,
}

fn read_wav_layout(path: &Path) -> Result<WavLayout> {
    let mut f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

    let mut header = [0u8; 12];
    f.read_exact(&mut header)
        .with_context(|| format!("{} is too short for a WAV header", path.display()))?;
    if &header[0..4] != b"RIFF" || &header[8..12] != b"WAVE" {
        bail!("{} is not a RIFF/WAVE file", path.display());
    }

    let mut fmt: Option<Vec<u8>> = None;
    loop {
        let mut chunk_header = [0u8; 8];
        if f.read_exact(&mut chunk_header).is_err() {
            break;
        }
        let id = &chunk_header[0..4];
        let len = u32::from_le_bytes([chunk_header[4], chunk_header[5], chunk_header[6], chunk_header[7]]);

        if id == b"fmt " {
            let mut buf = vec![0u8; len as usize];
            f.read_exact(&mut buf)?;
            fmt = Some(buf);
            if len % 2 == 1 {
                f.seek(SeekFrom::Current(1))?;
            }
        } else if id == b"data" {
            let fmt = fmt.ok_or_else(|| anyhow!("{}: data chunk before fmt chunk", path.display()))?;
            return Ok(WavLayout {
                fmt,
                data_offset: f.stream_position()?,
                data_len: len,
            });
        } else {
            // Chunks are word aligned.
            f.seek(SeekFrom::Current(len as i64 + (len % 2) as i64))?;
        }
    }
    Err(anyhow!("{}: no data chunk", path.display()))
}

/// Joins WAV files sample-for-sample into `output`.
///
/// Every input must share the first input's format block; the result has a
/// single `fmt ` and a single `data` chunk.
pub fn concat_wav_files(inputs: &[PathBuf], output: &Path) -> Result<()> {
    let Some(first) = inputs.first() else {
        bail!("No WAV inputs to join");
    };

    let base = read_wav_layout(first)?;
    let mut layouts = Vec::with_capacity(inputs.len());
    let mut total: u64 = 0;
    for path in inputs {
        let layout = read_wav_layout(path)?;
        if layout.fmt != base.fmt {
            bail!(
                "WAV format of {} differs from {}; decode all parts at the same rate and channel count",
                path.display(),
                first.display()
            );
        }
        total += layout.data_len as u64;
        layouts.push(layout);
    }

    let riff_len = 4 + 8 + base.fmt.len() as u64 + (base.fmt.len() % 2) as u64 + 8 + total + total % 2;
    let riff_len = u32::try_from(riff_len).map_err(|_| anyhow!("Joined WAV exceeds 4 GiB"))?;
    let data_len = total as u32;

    let mut out = BufWriter::new(
        File::create(output).with_context(|| format!("Failed to create {}", output.display()))?,
    );
    out.write_all(b"RIFF")?;
    out.write_all(&riff_len.to_le_bytes())?;
    out.write_all(b"WAVE")?;
    out.write_all(b"fmt ")?;
    out.write_all(&(base.fmt.len() as u32).to_le_bytes())?;
    out.write_all(&base.fmt)?;
    if base.fmt.len() % 2 == 1 {
        out.write_all(&[0])?;
    }
    out.write_all(b"data")?;
    out.write_all(&data_len.to_le_bytes())?;

    for (path, layout) in inputs.iter().zip(&layouts) {
        let mut input = File::open(path)?;
        input.seek(SeekFrom::Start(layout.data_offset))?;
        let copied = std::io::copy(&mut input.take(layout.data_len as u64), &mut out)?;
        if copied != layout.data_len as u64 {
            bail!("{} is truncated", path.display());
        }
    }
    if total % 2 == 1 {
        out.write_all(&[0])?;
    }
    out.flush()?;
    Ok(())
}
