use anyhow::Result;

use crate::commands::CommandReport;
use crate::vault::chunk::ContentRange;
use crate::vault::ledger::{ResumeLedger, bookmark_path, inspect_bookmark, list_bookmarks};
use crate::vault::paths::resolve_paths;

#[derive(Debug, Clone)]
pub enum BookmarkAction {
    List,
    Show { name: String },
    Discard { name: String },
}

fn opt(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

pub fn run(action: &BookmarkAction) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let dir = &paths.bookmarks_dir;

    match action {
        BookmarkAction::List => {
            let mut report = CommandReport::new("bookmark-list");
            let bookmarks = list_bookmarks(dir)?;
            report.detail(format!("bookmarks_dir={}", dir.display()));
            report.detail(format!("bookmarks={}", bookmarks.len()));
            for bookmark in bookmarks {
                match (&bookmark.record, &bookmark.error) {
                    (Some(record), _) => report.detail(format!(
                        "bookmark={} vault={} part_size={} session_id={} confirmed={} updated_at={}",
                        bookmark.name,
                        opt(record.vault.as_deref()),
                        record
                            .part_size
                            .map(|size| size.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        opt(record.session_id.as_deref()),
                        record.confirmed.len(),
                        record.updated_at_epoch_secs
                    )),
                    (None, error) => report.detail(format!(
                        "bookmark={} status=unreadable error={}",
                        bookmark.name,
                        opt(error.as_deref())
                    )),
                }
            }
            Ok(report)
        }
        BookmarkAction::Show { name } => {
            let mut report = CommandReport::new("bookmark-show");
            let Some(record) = inspect_bookmark(dir, name)? else {
                report.issue(format!("bookmark `{name}` not found"));
                return Ok(report);
            };
            report.detail(format!("path={}", bookmark_path(dir, name)?.display()));
            report.detail(format!("vault={}", opt(record.vault.as_deref())));
            report.detail(format!(
                "part_size={}",
                record
                    .part_size
                    .map(|size| size.to_string())
                    .unwrap_or_else(|| "-".to_string())
            ));
            report.detail(format!("session_id={}", opt(record.session_id.as_deref())));
            report.detail(format!("confirmed={}", record.confirmed.len()));

            let mut ranges = record
                .confirmed
                .iter()
                .filter_map(|(key, hash)| ContentRange::parse_ledger_key(key).map(|r| (r, hash)))
                .collect::<Vec<_>>();
            ranges.sort_by_key(|(range, _)| *range);
            for (range, hash) in ranges {
                report.detail(format!("range={}-{} tree_hash={hash}", range.start, range.end));
            }
            Ok(report)
        }
        BookmarkAction::Discard { name } => {
            let mut report = CommandReport::new("bookmark-discard");
            let mut ledger = ResumeLedger::open(dir, name)?;
            let existed = ledger.path().exists();
            ledger.discard()?;
            report.detail(format!("bookmark={name}"));
            report.detail(format!("discarded={existed}"));
            Ok(report)
        }
    }
}
