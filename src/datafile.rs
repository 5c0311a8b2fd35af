//! Measurement data files.
//!
//! Layout on disk:
//!
//! ```text
//! <data_dir>/<YYYYMMDD>/<HHMMSS>_<name>/<HHMMSS>_<name>.dat
//!                                      /<HHMMSS>_<name>.settings.json
//!                                      /<HHMMSS>_<name>.set
//! ```
//!
//! The `.dat` file starts with `#` comment lines describing every column,
//! followed by tab-separated rows. A blank line ends each innermost row so
//! gnuplot and friends see the blocks of a map.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{AppResult, DaqError};
use crate::parameter::ParameterValue;
use crate::settings::MeasurementSettings;

/// Role of a data column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    /// Swept output
    Coordinate,
    /// Sampled input
    Value,
}

/// Header description of one data column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    /// Label from the settings
    pub name: String,
    /// Instrument id
    pub instrument: String,
    /// Parameter name
    pub parameter: String,
    /// Gain between sample and instrument units
    pub gain: f64,
    /// Role
    pub kind: ColumnKind,
    /// Sweep range (start, stop, step) for coordinates
    pub range: Option<(f64, f64, f64)>,
}

/// Columns for `settings`: active outputs, then active inputs.
pub fn columns_for(settings: &MeasurementSettings) -> Vec<Column> {
    let outputs = settings.active_outputs().map(|ch| Column {
        name: ch.label.clone(),
        instrument: ch.instrument.clone(),
        parameter: ch.parameter.clone(),
        gain: ch.gain,
        kind: ColumnKind::Coordinate,
        range: Some((ch.start, ch.stop, ch.step)),
    });
    let inputs = settings.active_inputs().map(|ch| Column {
        name: ch.label.clone(),
        instrument: ch.instrument.clone(),
        parameter: ch.parameter.clone(),
        gain: ch.gain,
        kind: ColumnKind::Value,
        range: None,
    });
    outputs.chain(inputs).collect()
}

/// Keep names usable as path components.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "data".to_string()
    } else {
        cleaned
    }
}

/// `<root>/<YYYYMMDD>/<HHMMSS>_<name>/<HHMMSS>_<name>.dat`
pub fn data_path(root: &Path, name: &str, timestamp: &DateTime<Local>) -> PathBuf {
    let stem = format!("{}_{}", timestamp.format("%H%M%S"), sanitize_name(name));
    root.join(timestamp.format("%Y%m%d").to_string())
        .join(&stem)
        .join(format!("{stem}.dat"))
}

/// Open data file of a running sweep.
pub struct DataFile {
    path: PathBuf,
    file: BufWriter<File>,
    rows_format: csv::WriterBuilder,
    columns: usize,
    rows: usize,
}

impl DataFile {
    /// Create the directory tree and write the header.
    pub fn create(
        root: &Path,
        settings: &MeasurementSettings,
        columns: &[Column],
        started: &DateTime<Local>,
    ) -> AppResult<Self> {
        let path = data_path(root, &settings.filename, started);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut file = BufWriter::new(File::create(&path)?);
        writeln!(file, "# Filename: {}", path.display())?;
        writeln!(file, "# Timestamp: {}", started.format("%a %b %e %H:%M:%S %Y"))?;
        writeln!(file, "# Measurement: {}", settings.name)?;
        for line in settings.comment.lines() {
            writeln!(file, "# Comment: {line}")?;
        }
        writeln!(
            file,
            "# Plot: line={} map={} x={} y={}",
            settings.plot.line,
            settings.plot.map,
            settings
                .plot
                .x_column
                .map_or_else(|| "-".to_string(), |c| c.to_string()),
            settings
                .plot
                .y_columns
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        )?;
        writeln!(file)?;
        for (i, column) in columns.iter().enumerate() {
            writeln!(file, "# Column {}:", i + 1)?;
            writeln!(file, "#\tname: {}", column.name)?;
            writeln!(file, "#\tsource: {}.{}", column.instrument, column.parameter)?;
            writeln!(file, "#\tgain: {}", column.gain)?;
            match column.range {
                Some((start, stop, step)) => {
                    writeln!(file, "#\ttype: coordinate")?;
                    writeln!(file, "#\trange: {start} -> {stop} step {step}")?;
                }
                None => writeln!(file, "#\ttype: value")?,
            }
        }
        writeln!(file)?;

        let mut rows_format = csv::WriterBuilder::new();
        rows_format
            .delimiter(b'\t')
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'));

        Ok(Self {
            path,
            file,
            rows_format,
            columns: columns.len(),
            rows: 0,
        })
    }

    /// Path of the `.dat` file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Append one row.
    pub fn write_row(&mut self, values: &[f64]) -> AppResult<()> {
        if values.len() != self.columns {
            return Err(DaqError::Instrument(format!(
                "row has {} values, file has {} columns",
                values.len(),
                self.columns
            )));
        }
        let mut row = self.rows_format.from_writer(Vec::new());
        row.serialize(values).map_err(std::io::Error::from)?;
        let bytes = row.into_inner().map_err(|e| e.into_error())?;
        self.file.write_all(&bytes)?;
        self.rows += 1;
        Ok(())
    }

    /// End the current block with a blank line.
    pub fn new_block(&mut self) -> AppResult<()> {
        self.file.write_all(b"\n")?;
        Ok(())
    }

    /// Flush everything to disk.
    pub fn flush(&mut self) -> AppResult<()> {
        self.file.flush()?;
        Ok(())
    }

    /// Flush and close, returning the path.
    pub fn finish(mut self) -> AppResult<PathBuf> {
        self.flush()?;
        Ok(self.path)
    }

    /// `<stem>.<suffix>` next to the data file.
    pub fn sibling(&self, suffix: &str) -> PathBuf {
        sibling_path(&self.path, suffix)
    }
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}.{suffix}"))
}

/// Write `<stem>.settings.json` next to `data_path`.
pub fn write_settings_snapshot(
    data_path: &Path,
    settings: &MeasurementSettings,
) -> AppResult<PathBuf> {
    let path = sibling_path(data_path, "settings.json");
    settings.save(&path)?;
    Ok(path)
}

/// Write `<stem>.set` with every instrument's cached parameters.
pub fn write_parameter_snapshot(
    data_path: &Path,
    snapshot: &BTreeMap<String, BTreeMap<String, ParameterValue>>,
) -> AppResult<PathBuf> {
    let path = sibling_path(data_path, "set");
    let mut file = BufWriter::new(File::create(&path)?);
    for (instrument, params) in snapshot {
        writeln!(file, "Instrument: {instrument}")?;
        for (name, value) in params {
            writeln!(file, "\t{name}: {value}")?;
        }
    }
    file.flush()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{InputChannel, OutputChannel};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn settings() -> MeasurementSettings {
        let mut settings = MeasurementSettings::new("gate sweep")
            .with_output(OutputChannel::new("Vg", "dac", "ch1").sweep(0.0, 1.0, 0.5))
            .with_input(InputChannel::new("I", "dmm", "voltage"));
        settings.filename = "gate sweep".to_string();
        settings.comment = "cooldown 3\nsample B".to_string();
        settings
    }

    fn timestamp() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 7, 14, 5, 9).unwrap()
    }

    #[test]
    fn test_data_path_layout() {
        let path = data_path(Path::new("/data"), "gate sweep", &timestamp());
        assert_eq!(
            path,
            PathBuf::from("/data/20240307/140509_gate_sweep/140509_gate_sweep.dat")
        );
    }

    #[test]
    fn test_header_and_blocks() {
        let dir = tempdir().unwrap();
        let settings = settings();
        let columns = columns_for(&settings);
        let mut file = DataFile::create(dir.path(), &settings, &columns, &timestamp()).unwrap();
        file.write_row(&[0.0, 1.5]).unwrap();
        file.new_block().unwrap();
        file.write_row(&[0.5, -2.0]).unwrap();
        assert!(file.write_row(&[1.0]).is_err());
        let path = file.finish().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("# Comment: cooldown 3\n# Comment: sample B\n"));
        assert!(text.contains("# Column 1:\n#\tname: Vg\n#\tsource: dac.ch1\n"));
        assert!(text.contains("#\ttype: value"));

        let body: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(body, vec!["", "", "0.0\t1.5", "", "0.5\t-2.0"]);
    }

    #[test]
    fn test_flush_exposes_rows_while_open() {
        let dir = tempdir().unwrap();
        let settings = settings();
        let columns = columns_for(&settings);
        let mut file = DataFile::create(dir.path(), &settings, &columns, &timestamp()).unwrap();
        file.write_row(&[0.0, 1.5]).unwrap();
        file.new_block().unwrap();
        file.write_row(&[0.5, -2.0]).unwrap();
        file.flush().unwrap();

        let text = fs::read_to_string(file.path()).unwrap();
        assert!(text.ends_with("\n\n0.0\t1.5\n\n0.5\t-2.0\n"), "{text:?}");
        assert_eq!(file.rows(), 2);
    }

    #[test]
    fn test_snapshots_sit_next_to_data() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("140509_x.dat");
        let settings_path = write_settings_snapshot(&data, &settings()).unwrap();
        assert_eq!(settings_path, dir.path().join("140509_x.settings.json"));

        let mut snapshot = BTreeMap::new();
        snapshot.insert(
            "dac".to_string(),
            BTreeMap::from([("ch1".to_string(), ParameterValue::Float(0.25))]),
        );
        let set_path = write_parameter_snapshot(&data, &snapshot).unwrap();
        let text = fs::read_to_string(set_path).unwrap();
        assert_eq!(text, "Instrument: dac\n\tch1: 0.25\n");
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name(" a/b c "), "a_b_c");
        assert_eq!(sanitize_name(""), "data");
    }
}
