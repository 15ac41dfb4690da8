use flate2::read::GzDecoder;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

///
/// Open a file for reading, and return a buffered reader
/// * `input_file` - file name--either gzipped or not
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let ext = Path::new(input_file).extension().and_then(|x| x.to_str());
    let file = File::open(input_file)?;
    match ext {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

///
/// Open a file for writing, and return a buffered writer
/// * `output_file` - file name--either gzipped or not, or `stdout`
pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn Write>> {
    if output_file.eq_ignore_ascii_case("stdout") {
        return Ok(Box::new(BufWriter::new(std::io::stdout())));
    }

    let ext = Path::new(output_file).extension().and_then(|x| x.to_str());
    let file = File::create(output_file)?;
    match ext {
        Some("gz") => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            Ok(Box::new(BufWriter::new(encoder)))
        }
        _ => Ok(Box::new(BufWriter::new(file))),
    }
}

///
/// Write every line into the output_file
///
/// * `lines` - vector of lines
/// * `output_file` - file name--either gzipped or not
///
pub fn write_lines(lines: &[Box<str>], output_file: &str) -> anyhow::Result<()> {
    let mut buf = open_buf_writer(output_file)?;
    for line in lines {
        if let Err(e) = writeln!(buf, "{}", line) {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                return Ok(());
            }
            return Err(anyhow::anyhow!("unexpected error: {}", e));
        }
    }
    buf.flush()?;
    Ok(())
}

///
/// Read a delimited text file of numbers, one row per line.
///
/// * `input_file` - file name--either gzipped or not
/// * `delim` - column delimiter; whitespace when `None`
/// * `skip` - number of header lines to skip
///
/// Lines starting with `#` or `%` are comments. Every row must have
/// the same number of columns.
pub fn read_numeric_rows<T>(
    input_file: &str,
    delim: Option<&str>,
    skip: usize,
) -> anyhow::Result<Vec<Vec<T>>>
where
    T: FromStr + Send,
    <T as FromStr>::Err: std::fmt::Display,
{
    let buf = open_buf_reader(input_file)?;

    let mut lines_raw = vec![];
    for line in buf.lines().skip(skip) {
        let line = line?;
        if line.starts_with('#') || line.starts_with('%') || line.trim().is_empty() {
            continue;
        }
        lines_raw.push(line);
    }

    // parsing takes more time than reading
    let rows = lines_raw
        .par_iter()
        .enumerate()
        .map(|(i, line)| {
            let words: Vec<&str> = match delim {
                Some(d) => line.split(d).map(str::trim).collect(),
                None => line.split_whitespace().collect(),
            };
            words
                .into_iter()
                .map(|w| {
                    w.parse::<T>().map_err(|e| {
                        anyhow::anyhow!("{}: line {}: failed to parse '{}': {}", input_file, i, w, e)
                    })
                })
                .collect::<anyhow::Result<Vec<T>>>()
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    if let Some(first) = rows.first() {
        let ncol = first.len();
        if let Some((i, _)) = rows.iter().enumerate().find(|(_, r)| r.len() != ncol) {
            return Err(anyhow::anyhow!(
                "{}: row {} has a different number of columns (expected {})",
                input_file,
                i,
                ncol
            ));
        }
    }

    Ok(rows)
}

///
/// Create a temporary file that outlives the handle and return its path
/// * `suffix` - suffix of the file name
///
pub fn create_temp_dir_file(suffix: &str) -> anyhow::Result<std::path::PathBuf> {
    let temp_file = tempfile::Builder::new().suffix(suffix).tempfile()?;
    let (_, path) = temp_file.keep()?;
    Ok(path)
}

///
/// Remove a file if it exists
/// * `file` - file name
///
pub fn remove_file(file: &Path) -> anyhow::Result<()> {
    if file.is_file() {
        std::fs::remove_file(file)?;
    }
    Ok(())
}
