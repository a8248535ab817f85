//! Per-run JSON and markdown reports.
//!
//! A [`Report`] stage passes its records through untouched and, once its
//! input closes, writes `<output>/<base>.json` and `<output>/<base>.md`
//! where `<base>` is the `filename` option or `<prefix>-<unix timestamp>`.

use std::{
    collections::BTreeMap,
    fmt::Write as _,
    io::Write as _,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info};

use crate::{
    azure::ArgQueryResult,
    options::{FILENAME, OUTPUT},
    pipeline::{Inbox, Outbox, Stage, StageContext},
    resource::EnrichedResource,
    util::{unix_timestamp, Counted},
};

/// A record that can be grouped and laid out as a markdown table row.
pub trait ReportRecord: Serialize + Send + Sync + 'static {
    /// Records are grouped by this key, e.g. a template id or resource type.
    fn group(&self) -> String;

    /// Heading of the group's markdown section.
    fn group_title(&self) -> String {
        self.group()
    }

    fn headers() -> &'static [&'static str];

    fn row(&self) -> Vec<String>;
}

impl ReportRecord for EnrichedResource {
    fn group(&self) -> String {
        self.type_name.clone()
    }

    fn headers() -> &'static [&'static str] {
        &["Identifier", "Region", "Account"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.identifier.clone(), self.region.clone(), self.account_id.clone()]
    }
}

impl ReportRecord for ArgQueryResult {
    fn group(&self) -> String {
        self.template_id.clone()
    }

    fn group_title(&self) -> String {
        let details = &self.template_details;
        if details.severity.is_empty() {
            details.name.clone()
        } else {
            format!("{} ({})", details.name, details.severity)
        }
    }

    fn headers() -> &'static [&'static str] {
        &["Resource", "Type", "Location", "Subscription"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.resource_name.clone(),
            self.resource_type.clone(),
            self.location.clone(),
            self.subscription_id.clone(),
        ]
    }
}

impl ReportRecord for String {
    fn group(&self) -> String {
        "scanner".to_string()
    }

    fn group_title(&self) -> String {
        "Scanner output".to_string()
    }

    fn headers() -> &'static [&'static str] {
        &["Output"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.clone()]
    }
}

fn group<R: ReportRecord>(records: &[R]) -> BTreeMap<String, Vec<&R>> {
    let mut groups: BTreeMap<String, Vec<&R>> = BTreeMap::new();
    for record in records {
        groups.entry(record.group()).or_default().push(record);
    }
    groups
}

fn escape_cell(cell: &str) -> String {
    cell.trim().replace('|', "\\|").replace("\r\n", "<br>").replace('\n', "<br>")
}

fn table(out: &mut String, headers: &[&str], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len().max(3)).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }
    let line = |cells: &mut dyn Iterator<Item = String>| {
        let padded: Vec<String> =
            cells.zip(&widths).map(|(cell, width)| format!("{cell:<width$}")).collect();
        format!("| {} |\n", padded.join(" | "))
    };
    out.push_str(&line(&mut headers.iter().map(|h| h.to_string())));
    out.push_str(&line(&mut widths.iter().map(|w| "-".repeat(*w))));
    for row in rows {
        out.push_str(&line(&mut row.iter().cloned().chain(std::iter::repeat(String::new())).take(widths.len())));
    }
}

/// Renders grouped records as markdown. Groups without records get no section.
pub fn render_markdown<R: ReportRecord>(title: &str, records: &[R]) -> String {
    let mut out = format!("# {title}\n\n");
    if records.is_empty() {
        out.push_str("No results.\n");
        return out;
    }
    for members in group(records).values() {
        let Some(first) = members.first() else {
            continue;
        };
        let _ = writeln!(out, "## {}\n", first.group_title());
        let rows: Vec<Vec<String>> =
            members.iter().map(|r| r.row().iter().map(|c| escape_cell(c)).collect()).collect();
        table(&mut out, R::headers(), &rows);
        out.push('\n');
    }
    out
}

/// Writes both report files and returns their paths.
pub fn write_report<R: ReportRecord>(
    dir: &Path,
    base: &str,
    title: &str,
    records: &[R],
) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let json_path = dir.join(format!("{base}.json"));
    let mut json = std::io::BufWriter::new(
        std::fs::File::create(&json_path).with_context(|| format!("Failed to create {}", json_path.display()))?,
    );
    serde_json::to_writer_pretty(&mut json, &group(records))?;
    writeln!(json)?;
    json.flush()?;

    let md_path = dir.join(format!("{base}.md"));
    std::fs::write(&md_path, render_markdown(title, records))
        .with_context(|| format!("Failed to write {}", md_path.display()))?;
    Ok((json_path, md_path))
}

/// The `filename` option, or `<prefix>-<unix timestamp>`.
pub fn report_base(filename: &str, prefix: &str) -> String {
    let filename = filename.trim();
    if filename.is_empty() {
        format!("{prefix}-{}", unix_timestamp())
    } else {
        filename.trim_end_matches(".json").trim_end_matches(".md").to_string()
    }
}

/// Pass-through stage that writes the run's report when its input closes.
pub struct Report<R> {
    title: &'static str,
    prefix: &'static str,
    _records: PhantomData<fn(R)>,
}

impl<R> Report<R> {
    pub fn new(title: &'static str, prefix: &'static str) -> Self {
        Self { title, prefix, _records: PhantomData }
    }
}

#[async_trait]
impl<R> Stage<R, R> for Report<R>
where
    R: ReportRecord + Clone,
{
    fn name(&self) -> &'static str {
        "report"
    }

    async fn apply(&self, ctx: StageContext, mut inbox: Inbox<R>, outbox: Outbox<R>) {
        let mut records = Vec::new();
        while let Some(record) = inbox.recv(&ctx).await {
            records.push(record.clone());
            outbox.send(record);
        }

        let dir = PathBuf::from(ctx.option(OUTPUT));
        let base = report_base(&ctx.option(FILENAME), self.prefix);
        let title = self.title;
        let count = records.len();
        let written = tokio::task::spawn_blocking(move || write_report(&dir, &base, title, &records)).await;
        match written {
            Ok(Ok((json, md))) => {
                info!("Wrote {} to {} and {}", Counted::regular(count, "record"), json.display(), md.display())
            }
            Ok(Err(e)) => error!("Failed to write report: {e:#}"),
            Err(e) => error!("Report writer failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::{
        options::OptionSet,
        pipeline::{run_to_end, Generator, StageExt},
    };

    fn resource(id: &str, type_name: &str) -> EnrichedResource {
        EnrichedResource::new(id, type_name, "us-east-1", "1234", "{}")
    }

    #[test]
    fn markdown_groups_and_escapes() {
        let records = vec![
            resource("b|1", "AWS::S3::Bucket"),
            resource("fn", "AWS::Lambda::Function"),
            resource("b2", "AWS::S3::Bucket"),
        ];
        let md = render_markdown("Resources", &records);
        assert!(md.starts_with("# Resources\n"));
        let lambda = md.find("## AWS::Lambda::Function").unwrap();
        let s3 = md.find("## AWS::S3::Bucket").unwrap();
        assert!(lambda < s3);
        assert!(md.contains("b\\|1"));
        assert!(!md.contains("## AWS::EC2"));
        assert!(md.contains("| Identifier | Region    | Account |"));
    }

    #[test]
    fn empty_reports_say_so() {
        let md = render_markdown::<String>("Secrets", &[]);
        assert_eq!(md, "# Secrets\n\nNo results.\n");
        let md = render_markdown("Secrets", &["line one\nline two".to_string()]);
        assert!(md.contains("line one<br>line two"));
    }

    #[test]
    fn base_name_prefers_the_filename_option() {
        assert_eq!(report_base("run-1.json", "aws"), "run-1");
        assert!(report_base("", "aws-list-all").starts_with("aws-list-all-"));
    }

    #[tokio::test]
    async fn stage_passes_through_and_writes_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ctx = StageContext::new(
            OptionSet::new().with(OUTPUT, dir.path().to_string_lossy()).with(FILENAME, "report"),
        );
        let records = vec![resource("a", "AWS::S3::Bucket"), resource("b", "AWS::S3::Bucket")];
        let pipeline = Generator::new(records.clone()).then(Report::new("Resources", "aws"));
        let out = run_to_end(pipeline.boxed(), &ctx).await;
        assert_eq!(out, records);

        let json: Value = serde_json::from_str(&std::fs::read_to_string(dir.path().join("report.json"))?)?;
        assert_eq!(json["AWS::S3::Bucket"].as_array().map(Vec::len), Some(2));
        assert_eq!(json["AWS::S3::Bucket"][0]["Identifier"], "a");
        let md = std::fs::read_to_string(dir.path().join("report.md"))?;
        assert!(md.contains("## AWS::S3::Bucket"));
        Ok(())
    }
}
