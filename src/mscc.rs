//! Cohort summary of maximum spinal cord compression (MSCC) metrics.
//!
//! Per-subject MSCC tables written by the toolkit are reduced to the row at
//! each subject's clinically reported maximum compression level, joined with
//! the mJOA score from `participants.tsv`, and correlated.
use crate::stats::{correlation_p_value, spearman};
use crate::util::write_json;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const SUMMARY_CSV: &str = "mscc_summary.csv";
pub const STATS_JSON: &str = "mscc_stats.json";

const LEVEL_COLUMN: &str = "Compression Level";
const MSCC_COLUMN: &str = "MSCC";
const MSCC_NORM_COLUMN: &str = "Normalized MSCC";

/// Disc label values for the intervertebral levels reported clinically.
pub const DISC_LEVELS: [(&str, f64); 5] = [
    ("C2/C3", 3.0),
    ("C3/C4", 4.0),
    ("C4/C5", 5.0),
    ("C5/C6", 6.0),
    ("C6/C7", 7.0),
];

pub fn disc_level(label: &str) -> Option<f64> {
    DISC_LEVELS
        .iter()
        .find(|(name, _)| *name == label.trim())
        .map(|(_, value)| *value)
}

/// Inputs to one summary run.
pub struct MsccSummaryRequest<'a> {
    pub input_dir: &'a Path,
    pub participants: &'a Path,
    pub out_dir: &'a Path,
    pub exclude: Option<&'a Path>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectMscc {
    pub subject: String,
    pub level: f64,
    pub mscc: f64,
    pub mscc_norm: Option<f64>,
    pub mjoa: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MsccStats {
    pub subjects: usize,
    /// Subjects with an mJOA score, used for correlation.
    pub paired: usize,
    pub excluded: Vec<String>,
    pub spearman_mjoa_mscc: Option<f64>,
    pub p_mjoa_mscc: Option<f64>,
    pub spearman_mjoa_mscc_norm: Option<f64>,
    pub p_mjoa_mscc_norm: Option<f64>,
}

/// Values read from the row chosen for one subject.
#[derive(Debug, Clone, Copy, PartialEq)]
struct MsccRow {
    level: f64,
    mscc: f64,
    mscc_norm: Option<f64>,
}

/// (level, MSCC, normalized MSCC) as read from one table row.
type MsccCells = (f64, Option<f64>, Option<f64>);

#[derive(Debug, Clone)]
struct Participant {
    max_compression_level: Option<String>,
    mjoa: Option<f64>,
}

/// Split one record, honoring double-quoted cells and `""` escapes.
fn split_record(line: &str, delimiter: char) -> Vec<String> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if quoted && chars.peek() == Some(&'"') => {
                cell.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ch if ch == delimiter && !quoted => {
                cells.push(cell.trim().to_string());
                cell.clear();
            }
            ch => cell.push(ch),
        }
    }
    cells.push(cell.trim().to_string());
    cells
}

/// Parse a delimited table with a header row into column-keyed records.
fn parse_table(text: &str, delimiter: char) -> Vec<BTreeMap<String, String>> {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let columns = split_record(header, delimiter);
    lines
        .map(|line| {
            columns
                .iter()
                .cloned()
                .zip(split_record(line, delimiter))
                .collect()
        })
        .collect()
}

/// Blank, `nan` and `n/a` cells read as missing.
fn parse_number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|number| number.is_finite())
}

fn read_participants(path: &Path) -> Result<BTreeMap<String, Participant>> {
    if !path.is_file() {
        return Err(anyhow!("participants file {} not found", path.display()));
    }
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut participants = BTreeMap::new();
    for row in parse_table(&text, '\t') {
        let Some(id) = row.get("participant_id").filter(|id| !id.is_empty()) else {
            continue;
        };
        participants.insert(
            id.clone(),
            Participant {
                max_compression_level: row.get("max_compression_level").cloned(),
                mjoa: row.get("mjoa").and_then(|value| parse_number(value)),
            },
        );
    }
    Ok(participants)
}

/// Load the exclude list: a YAML sequence of subject ids or file names.
pub fn read_exclude(path: &Path) -> Result<Vec<String>> {
    if !path.is_file() {
        return Err(anyhow!(
            "exclude file {} does not exist or path is wrong",
            path.display()
        ));
    }
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Option<Vec<String>> = serde_yaml::from_str(&text)
        .with_context(|| format!("parse exclude list {}", path.display()))?;
    Ok(entries.unwrap_or_default())
}

fn is_excluded(subject: &str, exclude: &[String]) -> bool {
    let prefix = format!("{subject}_");
    exclude
        .iter()
        .any(|entry| entry == subject || entry.starts_with(&prefix))
}

/// MSCC result files in `dir`, sorted by name.
fn mscc_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if path.is_file() && name.contains("_mscc") && name.ends_with(".csv") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Pick the row at `target` level, or the nearest level when absent.
///
/// Only the chosen row has to carry an MSCC value; rows without a level
/// are skipped.
fn select_row(path: &Path, target: f64) -> Result<MsccRow> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let number = |row: &BTreeMap<String, String>, column: &str| {
        row.get(column).and_then(|value| parse_number(value))
    };
    let rows: Vec<MsccCells> = parse_table(&text, ',')
        .iter()
        .filter_map(|row| {
            let level = number(row, LEVEL_COLUMN)?;
            Some((level, number(row, MSCC_COLUMN), number(row, MSCC_NORM_COLUMN)))
        })
        .collect();
    let exact = rows.iter().find(|(level, _, _)| *level == target);
    let chosen = match exact {
        Some(row) => Some(row),
        None => rows.iter().fold(None, |best: Option<&MsccCells>, row| match best {
            Some(current) if (current.0 - target).abs() <= (row.0 - target).abs() => Some(current),
            _ => Some(row),
        }),
    };
    let &(level, mscc, mscc_norm) = chosen
        .ok_or_else(|| anyhow!("{}: no rows with a {LEVEL_COLUMN:?} value", path.display()))?;
    let mscc = mscc
        .ok_or_else(|| anyhow!("{}: {MSCC_COLUMN:?} missing at level {level}", path.display()))?;
    Ok(MsccRow {
        level,
        mscc,
        mscc_norm,
    })
}

/// Reduce the per-subject tables; returns (kept rows, excluded subjects).
pub fn collect_subjects(
    input_dir: &Path,
    participants_path: &Path,
    exclude: &[String],
) -> Result<(Vec<SubjectMscc>, Vec<String>)> {
    let participants = read_participants(participants_path)?;
    let mut rows = Vec::new();
    let mut excluded = Vec::new();
    for path in mscc_files(input_dir)? {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let subject = name.split('_').next().unwrap_or_default().to_string();
        if is_excluded(&subject, exclude) {
            tracing::info!(subject = %subject, "excluded from summary");
            excluded.push(subject);
            continue;
        }
        let participant = participants
            .get(&subject)
            .ok_or_else(|| anyhow!("subject {subject} missing from participants file"))?;
        let label = participant.max_compression_level.as_deref().unwrap_or("");
        let target = disc_level(label).ok_or_else(|| {
            anyhow!("subject {subject}: unknown max_compression_level {label:?}")
        })?;
        let MsccRow {
            level,
            mscc,
            mscc_norm,
        } = select_row(&path, target)?;
        if level != target {
            tracing::debug!(subject = %subject, target, level, "using nearest compression level");
        }
        rows.push(SubjectMscc {
            subject,
            level,
            mscc,
            mscc_norm,
            mjoa: participant.mjoa,
        });
    }
    excluded.sort();
    excluded.dedup();
    Ok((rows, excluded))
}

/// Spearman r and its p-value over subjects where both values are present.
fn correlate(
    rows: &[SubjectMscc],
    metric: impl Fn(&SubjectMscc) -> Option<f64>,
) -> (usize, Option<f64>, Option<f64>) {
    let (mjoa, values): (Vec<f64>, Vec<f64>) = rows
        .iter()
        .filter_map(|row| Some((row.mjoa?, metric(row)?)))
        .unzip();
    let r = spearman(&mjoa, &values);
    let p = r.and_then(|r| correlation_p_value(r, mjoa.len()));
    (mjoa.len(), r, p)
}

pub fn compute_stats(rows: &[SubjectMscc], excluded: Vec<String>) -> MsccStats {
    let (paired, spearman_mjoa_mscc, p_mjoa_mscc) = correlate(rows, |row| Some(row.mscc));
    let (_, spearman_mjoa_mscc_norm, p_mjoa_mscc_norm) = correlate(rows, |row| row.mscc_norm);
    MsccStats {
        subjects: rows.len(),
        paired,
        excluded,
        spearman_mjoa_mscc,
        p_mjoa_mscc,
        spearman_mjoa_mscc_norm,
        p_mjoa_mscc_norm,
    }
}

fn render_csv(rows: &[SubjectMscc]) -> String {
    let optional = |value: Option<f64>| value.map(|value| value.to_string()).unwrap_or_default();
    let mut out = String::from("subject,level,MSCC,MSCC_norm,mJOA\n");
    for row in rows {
        out.push_str(&format!(
            "{},{},{},{},{}\n",
            row.subject,
            row.level,
            row.mscc,
            optional(row.mscc_norm),
            optional(row.mjoa)
        ));
    }
    out
}

/// Build the summary CSV and correlation stats under `out_dir`.
pub fn run_summary(request: &MsccSummaryRequest<'_>) -> Result<MsccStats> {
    let exclude = match request.exclude {
        Some(path) => read_exclude(path)?,
        None => Vec::new(),
    };
    let (rows, excluded) = collect_subjects(request.input_dir, request.participants, &exclude)?;
    let stats = compute_stats(&rows, excluded);

    fs::create_dir_all(request.out_dir)
        .with_context(|| format!("create {}", request.out_dir.display()))?;
    let csv_path = request.out_dir.join(SUMMARY_CSV);
    fs::write(&csv_path, render_csv(&rows))
        .with_context(|| format!("write {}", csv_path.display()))?;
    write_json(&request.out_dir.join(STATS_JSON), &stats)?;

    tracing::info!(
        subjects = stats.subjects,
        paired = stats.paired,
        r_mscc = ?stats.spearman_mjoa_mscc,
        p_mscc = ?stats.p_mjoa_mscc,
        r_mscc_norm = ?stats.spearman_mjoa_mscc_norm,
        p_mscc_norm = ?stats.p_mjoa_mscc_norm,
        "MSCC summary complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARTICIPANTS: &str = "participant_id\tmax_compression_level\tmjoa\n\
        sub-01\tC3/C4\t12\n\
        sub-02\tC5/C6\t15\n\
        sub-03\tC4/C5\t17\n\
        sub-04\tC2/C3\tn/a\n";

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, text).expect("write fixture");
        path
    }

    fn mscc_csv(rows: &[(u32, f64, f64)]) -> String {
        let mut text = String::from("\"Compression Level\",\"MSCC\",\"Normalized MSCC\"\n");
        for (level, mscc, norm) in rows {
            text.push_str(&format!("{level},{mscc},{norm}\n"));
        }
        text
    }

    #[test]
    fn selects_exact_level_or_nearest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exact = write(dir.path(), "a.csv", &mscc_csv(&[(3, 10.0, 1.0), (4, 20.0, 2.0)]));
        assert_eq!(select_row(&exact, 4.0).expect("row"), row(4.0, 20.0, Some(2.0)));

        let nearest = write(dir.path(), "b.csv", &mscc_csv(&[(3, 10.0, 1.0), (6, 30.0, 3.0)]));
        assert_eq!(select_row(&nearest, 5.0).expect("row"), row(6.0, 30.0, Some(3.0)));
        // Equidistant levels keep the first row, matching argmin.
        let tie = write(dir.path(), "c.csv", &mscc_csv(&[(4, 11.0, 1.1), (6, 30.0, 3.0)]));
        assert_eq!(select_row(&tie, 5.0).expect("row"), row(4.0, 11.0, Some(1.1)));
    }

    fn row(level: f64, mscc: f64, mscc_norm: Option<f64>) -> MsccRow {
        MsccRow {
            level,
            mscc,
            mscc_norm,
        }
    }

    #[test]
    fn blank_cells_only_matter_in_the_chosen_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = write(
            dir.path(),
            "a.csv",
            "Compression Level,MSCC,Normalized MSCC\n4,20.0,2.0\n5,30.0,\n,nan,1\n",
        );
        assert_eq!(select_row(&table, 4.0).expect("row"), row(4.0, 20.0, Some(2.0)));
        assert_eq!(select_row(&table, 5.0).expect("row"), row(5.0, 30.0, None));

        let no_mscc = write(
            dir.path(),
            "b.csv",
            "Compression Level,MSCC,Normalized MSCC\n4,n/a,2.0\n5,30.0,3.0\n",
        );
        let err = select_row(&no_mscc, 4.0).expect_err("chosen row lacks MSCC");
        assert!(err.to_string().contains("\"MSCC\" missing at level 4"), "{err}");
        assert_eq!(select_row(&no_mscc, 5.0).expect("row"), row(5.0, 30.0, Some(3.0)));
    }

    #[test]
    fn quoted_cells_keep_embedded_delimiters() {
        assert_eq!(
            split_record(r#""/data/a,b.nii.gz",3,"say ""hi"" there""#, ','),
            vec!["/data/a,b.nii.gz", "3", "say \"hi\" there"]
        );
        let dir = tempfile::tempdir().expect("tempdir");
        let table = write(
            dir.path(),
            "c.csv",
            "Filename,Compression Level,MSCC,Normalized MSCC\n\"/data/a,b.nii.gz\",3,12.5,1.25\n",
        );
        assert_eq!(select_row(&table, 3.0).expect("row"), row(3.0, 12.5, Some(1.25)));
    }

    #[test]
    fn summary_joins_participants_and_honors_exclusions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("results");
        fs::create_dir_all(&input).expect("create results");
        write(&input, "sub-01_T2w_mscc.csv", &mscc_csv(&[(3, 40.0, 4.0), (4, 35.0, 3.5)]));
        write(&input, "sub-02_T2w_mscc.csv", &mscc_csv(&[(6, 20.0, 2.0)]));
        write(&input, "sub-03_T2w_mscc.csv", &mscc_csv(&[(5, 10.0, 1.0)]));
        write(&input, "sub-04_T2w_mscc.csv", &mscc_csv(&[(3, 50.0, 5.0)]));
        write(&input, "sub-05_T2w_mscc.csv", &mscc_csv(&[(3, 1.0, 0.1)]));
        write(&input, "sub-01_T2w_csa.csv", "ignored");
        let participants = write(dir.path(), "participants.tsv", PARTICIPANTS);
        let exclude = write(dir.path(), "exclude.yml", "- sub-05_T2w.nii.gz\n");
        let out = dir.path().join("out");

        let stats = run_summary(&MsccSummaryRequest {
            input_dir: &input,
            participants: &participants,
            out_dir: &out,
            exclude: Some(&exclude),
        })
        .expect("summary");

        assert_eq!(stats.subjects, 4);
        assert_eq!(stats.paired, 3);
        assert_eq!(stats.excluded, vec!["sub-05".to_string()]);
        // mJOA 12, 15, 17 against MSCC 35, 20, 10: perfectly anti-monotonic.
        let r = stats.spearman_mjoa_mscc.expect("r");
        assert!((r + 1.0).abs() < 1e-9, "{r}");
        let p = stats.p_mjoa_mscc.expect("p");
        assert!(p < 1e-6, "{p}");
        assert!(stats.p_mjoa_mscc_norm.is_some());

        let csv = fs::read_to_string(out.join(SUMMARY_CSV)).expect("read csv");
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "subject,level,MSCC,MSCC_norm,mJOA");
        assert_eq!(lines[1], "sub-01,4,35,3.5,12");
        assert_eq!(lines[4], "sub-04,3,50,5,");
        assert!(out.join(STATS_JSON).is_file());
    }

    #[test]
    fn unknown_subject_or_level_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("results");
        fs::create_dir_all(&input).expect("create results");
        write(&input, "sub-09_T2w_mscc.csv", &mscc_csv(&[(3, 1.0, 0.1)]));
        let participants = write(dir.path(), "participants.tsv", PARTICIPANTS);
        assert!(collect_subjects(&input, &participants, &[]).is_err());

        let bad_level = write(
            dir.path(),
            "bad.tsv",
            "participant_id\tmax_compression_level\tmjoa\nsub-09\tT1/T2\t10\n",
        );
        let err = collect_subjects(&input, &bad_level, &[]).expect_err("bad level");
        assert!(err.to_string().contains("T1/T2"), "{err}");
    }

    #[test]
    fn exclude_list_accepts_empty_documents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let empty = write(dir.path(), "empty.yml", "");
        assert!(read_exclude(&empty).expect("empty list").is_empty());
        assert!(read_exclude(&dir.path().join("missing.yml")).is_err());
        assert!(is_excluded("sub-01", &["sub-01".to_string()]));
        assert!(!is_excluded("sub-1", &["sub-10_T2w.nii.gz".to_string()]));
    }
}
