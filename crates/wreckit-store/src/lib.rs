//! Atomic on-disk persistence for items, the index, and PRDs (§3, §4.1).
//!
//! Every write goes through [`atomic_write_json`]: serialize to a sibling
//! `.tmp` file, `sync_all`, `rename` over the destination, then fsync the
//! parent directory. A crash mid-write leaves either the old file or the
//! new one, never a half-written one.
//!
//! Layout under the repo's `.wreckit/` directory:
//!
//! ```text
//! .wreckit/
//!   index.json                   -- ItemSummary list, a cache over items/
//!   items/<section>/<seq>-<slug>/
//!     item.json
//!     prd.json                   -- once research has produced one
//!     logs/<phase>.log
//! ```
//!
//! The index is a cache, not the source of truth: [`reindex`] rebuilds it
//! from `items/` directory contents, and any reader that finds the two
//! disagreeing trusts the on-disk item record over the index entry.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use wreckit_types::{Item, ItemId, ItemSummary, Prd};

pub const ITEMS_DIR: &str = "items";
pub const INDEX_FILE: &str = "index.json";
pub const ITEM_FILE: &str = "item.json";
pub const PRD_FILE: &str = "prd.json";

pub(crate) fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create dir {}", parent.display()))?;
    }

    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;

    {
        let mut f = File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(&data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to rename tmp file {} to {}",
            tmp.display(),
            path.display()
        )
    })?;

    fsync_parent_dir(path);

    Ok(())
}

/// A `.wreckit/` directory rooted at a repository checkout.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(wreckit_dir: PathBuf) -> Self {
        Self { root: wreckit_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn item_dir(&self, id: &ItemId) -> PathBuf {
        self.root.join(ITEMS_DIR).join(id.as_str())
    }

    pub fn item_path(&self, id: &ItemId) -> PathBuf {
        self.item_dir(id).join(ITEM_FILE)
    }

    pub fn prd_path(&self, id: &ItemId) -> PathBuf {
        self.item_dir(id).join(PRD_FILE)
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub fn save_item(&self, item: &Item) -> Result<()> {
        atomic_write_json(&self.item_path(&item.id), item)
    }

    pub fn load_item(&self, id: &ItemId) -> Result<Option<Item>> {
        let path = self.item_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read item file {}", path.display()))?;
        let item: Item = migrate_item_json(&content, &path)?;
        Ok(Some(item))
    }

    pub fn save_prd(&self, id: &ItemId, prd: &Prd) -> Result<()> {
        atomic_write_json(&self.prd_path(id), prd)
    }

    pub fn load_prd(&self, id: &ItemId) -> Result<Option<Prd>> {
        let path = self.prd_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read prd file {}", path.display()))?;
        let prd: Prd = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse prd JSON {}", path.display()))?;
        Ok(Some(prd))
    }

    /// Scan `items/<section>/*` on disk and return every item found,
    /// ignoring the cached index entirely — the source of truth.
    pub fn scan_items(&self) -> Result<Vec<Item>> {
        let items_root = self.root.join(ITEMS_DIR);
        if !items_root.exists() {
            return Ok(Vec::new());
        }

        let mut items = Vec::new();
        for section_entry in fs::read_dir(&items_root)
            .with_context(|| format!("failed to read {}", items_root.display()))?
        {
            let section_entry = section_entry?;
            if !section_entry.file_type()?.is_dir() {
                continue;
            }
            for item_entry in fs::read_dir(section_entry.path())? {
                let item_entry = item_entry?;
                if !item_entry.file_type()?.is_dir() {
                    continue;
                }
                let item_path = item_entry.path().join(ITEM_FILE);
                if !item_path.exists() {
                    continue;
                }
                let content = fs::read_to_string(&item_path)
                    .with_context(|| format!("failed to read {}", item_path.display()))?;
                let item: Item = migrate_item_json(&content, &item_path)?;
                items.push(item);
            }
        }
        items.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(items)
    }

    pub fn load_index(&self) -> Result<Vec<ItemSummary>> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read index {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse index JSON {}", path.display()))
    }

    /// Rebuild `index.json` from the item directories on disk.
    pub fn reindex(&self) -> Result<Vec<ItemSummary>> {
        let items = self.scan_items()?;
        let summaries: Vec<ItemSummary> = items.iter().map(ItemSummary::from).collect();
        atomic_write_json(&self.index_path(), &summaries)?;
        tracing::debug!(count = summaries.len(), "rebuilt item index");
        Ok(summaries)
    }

    /// Allocates the next id in `section` and creates the item (§4.1
    /// "create"). The item directory itself is the claim: `create_dir`
    /// fails with `AlreadyExists` if another process claimed the same
    /// sequence number first, in which case this recomputes `next_sequence`
    /// and retries, so concurrent callers never collide on one id.
    pub fn create_item(&self, section: &str, title: &str, overview: &str) -> Result<Item> {
        let slug = slugify(title);
        loop {
            let seq = self.next_sequence(section)?;
            let id = ItemId::new(section, seq, &slug);
            let dir = self.item_dir(&id);
            fs::create_dir_all(dir.parent().expect("item dir has a parent"))
                .with_context(|| format!("failed to create {}", dir.display()))?;
            match fs::create_dir(&dir) {
                Ok(()) => {
                    let item = Item::new(id, title.to_string(), overview.to_string());
                    self.save_item(&item)?;
                    return Ok(item);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to claim {}", dir.display()));
                }
            }
        }
    }

    /// Allocate the next unused sequence number for `section` by scanning
    /// existing item directories — no counter file to go stale.
    pub fn next_sequence(&self, section: &str) -> Result<u32> {
        let section_dir = self.root.join(ITEMS_DIR).join(section);
        if !section_dir.exists() {
            return Ok(1);
        }
        let mut max_seq = 0u32;
        for entry in fs::read_dir(&section_dir)
            .with_context(|| format!("failed to read {}", section_dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && let Some((seq_str, _slug)) = name.split_once('-')
                && let Ok(seq) = seq_str.parse::<u32>()
            {
                max_seq = max_seq.max(seq);
            }
        }
        Ok(max_seq + 1)
    }
}

/// Lower-kebab-case a title for use in an item id. Non-alphanumeric runs
/// collapse to a single `-`; an all-punctuation title falls back to
/// `"untitled"` rather than producing an empty path segment.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut last_was_dash = false;
    for ch in title.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_was_dash = false;
        } else if !last_was_dash && !slug.is_empty() {
            slug.push('-');
            last_was_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

/// Parse an item record, migrating forward if its `schema_version` is
/// older than [`wreckit_types::item::ITEM_SCHEMA_V1`]. There is currently
/// only one schema generation, so this is presently the identity
/// transform, but it keeps the migration seam in place for the next one.
fn migrate_item_json(content: &str, path: &Path) -> Result<Item> {
    let value: serde_json::Value = serde_json::from_str(content)
        .with_context(|| format!("failed to parse item JSON {}", path.display()))?;

    let version = value
        .get("schema_version")
        .and_then(|v| v.as_str())
        .unwrap_or(wreckit_types::item::ITEM_SCHEMA_V1)
        .to_string();

    match version.as_str() {
        wreckit_types::item::ITEM_SCHEMA_V1 => serde_json::from_value(value)
            .with_context(|| format!("failed to deserialize item {}", path.display())),
        other => bail!(
            "unsupported item schema version '{other}' in {}",
            path.display()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wreckit_types::item::ITEM_SCHEMA_V1;

    fn sample_item(section: &str, seq: u32, slug: &str) -> Item {
        Item::new(
            ItemId::new(section, seq, slug),
            format!("Title {seq}"),
            "overview".into(),
        )
    }

    #[test]
    fn save_then_load_item_round_trips() {
        let td = tempfile::tempdir().unwrap();
        let store = Store::new(td.path().join(".wreckit"));
        let item = sample_item("features", 1, "add-thing");

        store.save_item(&item).unwrap();
        let loaded = store.load_item(&item.id).unwrap().unwrap();
        assert_eq!(loaded.title, item.title);
        assert_eq!(loaded.schema_version, ITEM_SCHEMA_V1);
    }

    #[test]
    fn load_item_returns_none_when_missing() {
        let td = tempfile::tempdir().unwrap();
        let store = Store::new(td.path().join(".wreckit"));
        let id = ItemId::new("features", 1, "nope");
        assert!(store.load_item(&id).unwrap().is_none());
    }

    #[test]
    fn reindex_rebuilds_summaries_from_directory_scan() {
        let td = tempfile::tempdir().unwrap();
        let store = Store::new(td.path().join(".wreckit"));
        store.save_item(&sample_item("features", 1, "a")).unwrap();
        store.save_item(&sample_item("features", 2, "b")).unwrap();
        store.save_item(&sample_item("bugs", 1, "c")).unwrap();

        let summaries = store.reindex().unwrap();
        assert_eq!(summaries.len(), 3);

        let reloaded = store.load_index().unwrap();
        assert_eq!(reloaded.len(), 3);
    }

    #[test]
    fn next_sequence_continues_after_highest_existing() {
        let td = tempfile::tempdir().unwrap();
        let store = Store::new(td.path().join(".wreckit"));
        store.save_item(&sample_item("features", 1, "a")).unwrap();
        store.save_item(&sample_item("features", 3, "b")).unwrap();

        assert_eq!(store.next_sequence("features").unwrap(), 4);
        assert_eq!(store.next_sequence("bugs").unwrap(), 1);
    }

    #[test]
    fn save_then_load_prd_round_trips() {
        let td = tempfile::tempdir().unwrap();
        let store = Store::new(td.path().join(".wreckit"));
        let id = ItemId::new("features", 1, "a");
        let prd = Prd {
            schema_version: wreckit_types::item::PRD_SCHEMA_V1.to_string(),
            problem_statement: "users can't do X".into(),
            goals: vec!["let them do X".into()],
            non_goals: vec![],
            stories: vec![],
            open_questions: vec![],
            references: vec![],
        };
        store.save_prd(&id, &prd).unwrap();
        let loaded = store.load_prd(&id).unwrap().unwrap();
        assert_eq!(loaded.problem_statement, prd.problem_statement);
    }

    #[test]
    fn slugify_collapses_punctuation_and_lowercases() {
        assert_eq!(slugify("Add a Rate Limiter!!"), "add-a-rate-limiter");
        assert_eq!(slugify("???"), "untitled");
    }

    #[test]
    fn create_item_allocates_a_fresh_id_and_persists_it() {
        let td = tempfile::tempdir().unwrap();
        let store = Store::new(td.path().join(".wreckit"));

        let item = store.create_item("features", "Add rate limiter", "overview").unwrap();
        assert_eq!(item.id.as_str(), "features/001-add-rate-limiter");

        let loaded = store.load_item(&item.id).unwrap().unwrap();
        assert_eq!(loaded.title, "Add rate limiter");
    }

    #[test]
    fn create_item_allocates_past_an_existing_directory() {
        let td = tempfile::tempdir().unwrap();
        let store = Store::new(td.path().join(".wreckit"));

        fs::create_dir_all(store.item_dir(&ItemId::new("features", 1, "some-other-item"))).unwrap();

        let item = store.create_item("features", "Add rate limiter", "overview").unwrap();
        assert_eq!(item.id.as_str(), "features/002-add-rate-limiter");
    }

    #[test]
    fn rejects_unknown_schema_version() {
        let td = tempfile::tempdir().unwrap();
        let store = Store::new(td.path().join(".wreckit"));
        let id = ItemId::new("features", 1, "bad");
        let path = store.item_path(&id);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"schema_version": "wreckit.item.v99"}"#).unwrap();

        let err = store.load_item(&id).unwrap_err();
        assert!(err.to_string().contains("unsupported item schema version"));
    }
}
