//! Logger setup and the per-batch progress table
//!
//! Every rank logs through the `log` facade. `init` installs an `env_logger`
//! whose output is written both to stderr and to `exp_dir/train.log`, with the
//! rank stamped into each line so interleaved multi-process output stays
//! readable.

use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Writes every buffer to stderr and, when present, to a log file.
struct Tee {
    file: Option<File>,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Install the global logger.
///
/// # Arguments
/// * `rank` - process rank, printed in every line
/// * `log_file` - file to append to in addition to stderr
///
/// The level defaults to `info`; `RUST_LOG` overrides it. A logger that is
/// already installed is kept and `log_file` is then not written.
pub fn init(rank: usize, log_file: Option<&Path>) -> anyhow::Result<()> {
    let file = match log_file {
        Some(path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
        None => None,
    };

    let installed = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(move |buf, record| {
            writeln!(
                buf,
                "[{}][{}][rank {}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                rank,
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(Tee { file })))
        .try_init();
    if let Err(e) = installed {
        log::debug!("keeping existing logger: {}", e);
    }

    Ok(())
}

/// Fixed-width text table in grid style, printed one row at a time.
///
/// ```text
/// +------------+------------+
/// |      Epoch |      Batch |
/// +------------+------------+
/// |          1 |        100 |
/// +------------+------------+
/// ```
pub struct Table {
    columns: usize,
    width: usize,
}

impl Table {
    pub fn new(columns: usize, width: usize) -> Self {
        Self { columns, width }
    }

    pub fn header<S: AsRef<str>>(&self, names: &[S]) -> String {
        format!("{}\n{}\n{}", self.rule(), self.row(names), self.rule())
    }

    pub fn row<S: AsRef<str>>(&self, values: &[S]) -> String {
        let cells: Vec<String> = (0..self.columns)
            .map(|i| {
                let value = values.get(i).map(|v| v.as_ref()).unwrap_or("");
                let value: String = value.chars().take(self.width).collect();
                format!(" {:>width$} ", value, width = self.width)
            })
            .collect();
        format!("|{}|", cells.join("|"))
    }

    pub fn bottom(&self) -> String {
        self.rule()
    }

    fn rule(&self) -> String {
        let segment = "-".repeat(self.width + 2);
        format!("+{}+", vec![segment; self.columns].join("+"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_layout() {
        let table = Table::new(2, 5);
        assert_eq!(table.bottom(), "+-------+-------+");
        assert_eq!(table.row(&["1", "abc"]), "|     1 |   abc |");
        let header = table.header(&["Epoch", "Lr"]);
        let lines: Vec<&str> = header.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "| Epoch |    Lr |");
    }

    #[test]
    fn test_table_truncates_and_pads() {
        let table = Table::new(2, 4);
        assert_eq!(table.row(&["123456"]), "| 1234 |      |");
    }

    #[test]
    fn test_tee_writes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.log");
        let mut tee = Tee {
            file: Some(File::create(&path).unwrap()),
        };
        tee.write_all(b"hello\n").unwrap();
        tee.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");
    }
}
