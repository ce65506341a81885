//! Local task edits: add, complete, remove, list.
//!
//! All of these work offline. Edits are queued and go out on the next
//! `opsync sync`.

use anyhow::Result;
use opsync_client::{HttpTransport, SyncClient};
use opsync_types::{EntityType, OpType};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;

use super::Session;

const ID_DISPLAY_LEN: usize = 8;

/// Find the task whose id is `prefix` or starts with it.
fn resolve_id(client: &SyncClient<HttpTransport>, prefix: &str) -> Result<String> {
    let ids: Vec<String> = client
        .entities(EntityType::Task)
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    if ids.iter().any(|id| id == prefix) {
        return Ok(prefix.to_string());
    }

    let mut matches = ids.into_iter().filter(|id| id.starts_with(prefix));
    match (matches.next(), matches.next()) {
        (Some(id), None) => Ok(id),
        (Some(_), Some(_)) => anyhow::bail!("Task id '{prefix}' is ambiguous"),
        (None, _) => anyhow::bail!("No task matching '{prefix}'"),
    }
}

fn short(id: &str) -> &str {
    id.get(..ID_DISPLAY_LEN).unwrap_or(id)
}

/// Run the add command. Returns the new task id.
pub async fn add(data_dir: &Path, title: &str, parent: Option<&str>) -> Result<String> {
    if title.trim().is_empty() {
        anyhow::bail!("Task title must not be empty");
    }
    let session = Session::open(data_dir).await?;

    let id = uuid::Uuid::new_v4().to_string();
    let mut payload = json!({ "title": title, "isDone": false });
    if let Some(parent) = parent {
        payload["parentId"] = Value::String(resolve_id(&session.client, parent)?);
    }

    session
        .client
        .record_local(OpType::Create, EntityType::Task, Some(id.clone()), payload)?;
    session.save().await?;

    println!("Added {} {}", short(&id), title);
    Ok(id)
}

/// Run the done command.
pub async fn done(data_dir: &Path, id: &str) -> Result<()> {
    let session = Session::open(data_dir).await?;
    let id = resolve_id(&session.client, id)?;

    session.client.record_local(
        OpType::Update,
        EntityType::Task,
        Some(id.clone()),
        json!({ "isDone": true }),
    )?;
    session.save().await?;

    println!("Completed {}", short(&id));
    Ok(())
}

/// Run the remove command. Subtasks go with their parent.
pub async fn remove(data_dir: &Path, id: &str) -> Result<()> {
    let session = Session::open(data_dir).await?;
    let id = resolve_id(&session.client, id)?;

    session
        .client
        .record_local(OpType::Delete, EntityType::Task, Some(id.clone()), json!({}))?;
    session.save().await?;

    println!("Removed {}", short(&id));
    Ok(())
}

/// One line per task, subtasks indented under their parent.
pub fn render(tasks: &[(String, Value)]) -> Vec<String> {
    let known: BTreeMap<&str, &Value> = tasks.iter().map(|(id, v)| (id.as_str(), v)).collect();
    let mut children: BTreeMap<Option<&str>, Vec<(&str, &Value)>> = BTreeMap::new();
    for (id, task) in tasks {
        let parent = task
            .get("parentId")
            .and_then(Value::as_str)
            .filter(|p| known.contains_key(p));
        children.entry(parent).or_default().push((id.as_str(), task));
    }
    for siblings in children.values_mut() {
        siblings.sort_by(|(a_id, a), (b_id, b)| title(a).cmp(title(b)).then(a_id.cmp(b_id)));
    }

    let mut lines = Vec::with_capacity(tasks.len());
    let mut stack: Vec<(&str, usize)> = children
        .get(&None)
        .map(|roots| roots.iter().rev().map(|(id, _)| (*id, 0)).collect())
        .unwrap_or_default();
    while let Some((id, depth)) = stack.pop() {
        let Some(task) = known.get(id) else { continue };
        let mark = if task.get("isDone").and_then(Value::as_bool).unwrap_or(false) {
            "x"
        } else {
            " "
        };
        lines.push(format!(
            "{}[{}] {}  {}",
            "  ".repeat(depth),
            mark,
            title(task),
            short(id)
        ));
        if let Some(kids) = children.get(&Some(id)) {
            stack.extend(kids.iter().rev().map(|(kid, _)| (*kid, depth + 1)));
        }
    }
    lines
}

fn title(task: &Value) -> &str {
    task.get("title").and_then(Value::as_str).unwrap_or("(untitled)")
}

/// Run the list command.
pub async fn list(data_dir: &Path) -> Result<()> {
    let session = Session::open(data_dir).await?;
    let tasks = session.client.entities(EntityType::Task);

    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    for line in render(&tasks) {
        println!("{line}");
    }
    Ok(())
}
