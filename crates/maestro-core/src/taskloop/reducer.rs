//! Copy-on-write merge of concurrent task updates.
//!
//! Parallel workers submit task deltas that can race on the same row. The
//! merge never mutates its inputs, keeps the higher attempt counter,
//! unions list fields without duplicates, and never lets a null overwrite
//! an existing value. Conflicts are detected across every mutually-set
//! scalar and collection field.

use maestro_db::models::Task;

/// Union `incoming` into `base`, preserving order and dropping
/// duplicates.
fn union_dedup(base: &[String], incoming: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = base.to_vec();
    for item in incoming {
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    merged
}

/// Merge two versions of a task into a fresh value.
///
/// Neither input is mutated. Rules, in order of application:
/// - `attempts`: the higher counter wins.
/// - list fields: union, deduplicated, existing order first.
/// - optional scalars: a `Some` in `incoming` wins; a `None` never
///   overwrites an existing value.
/// - `status`, `priority`, `title`: the incoming value wins (the writer
///   saw the row later).
pub fn merge_task_fields(existing: &Task, incoming: &Task) -> Task {
    let mut merged = existing.clone();

    merged.title = incoming.title.clone();
    merged.status = incoming.status;
    merged.priority = incoming.priority;
    merged.max_attempts = incoming.max_attempts.max(existing.max_attempts);
    merged.attempts = existing.attempts.max(incoming.attempts);

    merged.acceptance_criteria =
        union_dedup(&existing.acceptance_criteria, &incoming.acceptance_criteria);
    merged.dependencies = union_dedup(&existing.dependencies, &incoming.dependencies);
    merged.files_to_create = union_dedup(&existing.files_to_create, &incoming.files_to_create);
    merged.files_to_modify = union_dedup(&existing.files_to_modify, &incoming.files_to_modify);
    merged.test_files = union_dedup(&existing.test_files, &incoming.test_files);
    merged.files_created = union_dedup(&existing.files_created, &incoming.files_created);
    merged.files_modified = union_dedup(&existing.files_modified, &incoming.files_modified);

    if incoming.user_story.is_some() {
        merged.user_story = incoming.user_story.clone();
    }
    if incoming.implementation_notes.is_some() {
        merged.implementation_notes = incoming.implementation_notes.clone();
    }
    if incoming.error.is_some() {
        merged.error = incoming.error.clone();
    }
    if incoming.test_results.is_some() {
        merged.test_results = incoming.test_results.clone();
    }

    merged.updated_at = existing.updated_at.max(incoming.updated_at);

    merged
}

/// Whether two updates conflict: both set a field, to different values.
///
/// One-sided observations are complementary and do not conflict. The
/// check covers `error`, `implementation_notes`, `test_results`,
/// `files_created`, and `files_modified` -- the fields two workers can
/// legitimately race on.
pub fn detect_task_conflict(existing: &Task, incoming: &Task) -> bool {
    fn both_set_differ<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
        matches!((a, b), (Some(left), Some(right)) if left != right)
    }
    fn both_nonempty_differ(a: &[String], b: &[String]) -> bool {
        !a.is_empty() && !b.is_empty() && a != b
    }

    both_set_differ(&existing.error, &incoming.error)
        || both_set_differ(&existing.implementation_notes, &incoming.implementation_notes)
        || both_set_differ(&existing.test_results, &incoming.test_results)
        || both_nonempty_differ(&existing.files_created, &incoming.files_created)
        || both_nonempty_differ(&existing.files_modified, &incoming.files_modified)
}
