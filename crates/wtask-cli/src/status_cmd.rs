//! `wtask status`: report on main tasks saved by a previous `wtask run`.

use anyhow::Result;
use wtask_core::storage::{FileTaskStore, TaskStore};

fn store() -> FileTaskStore {
    FileTaskStore::new(config_state_dir())
}

fn config_state_dir() -> std::path::PathBuf {
    crate::config::config_dir().join("tasks")
}

/// Show one task's detail, or list every saved task id and status if `id`
/// is omitted.
pub fn run_status(id: Option<&str>) -> Result<()> {
    let store = store();

    match id {
        Some(id) => {
            let Some(mt) = store.load(id)? else {
                anyhow::bail!("no saved task found with id {id}");
            };
            println!("{} ({})", mt.title, mt.id);
            println!("  status: {}", mt.status);
            println!(
                "  progress: {}/{} subtasks ({:.0}%)",
                mt.completed_sub_tasks,
                mt.sub_tasks.len(),
                mt.get_progress()
            );
            if !mt.error_message.is_empty() {
                println!("  error: {}", mt.error_message);
            }
            for sub_task in &mt.sub_tasks {
                println!("  - [{}] {} ({})", sub_task.status, sub_task.title, sub_task.id);
            }
        }
        None => {
            let ids = store.list_ids()?;
            if ids.is_empty() {
                println!("no saved tasks");
                return Ok(());
            }
            for id in ids {
                if let Some(mt) = store.load(&id)? {
                    println!("{id}: {} ({}/{})", mt.status, mt.completed_sub_tasks, mt.sub_tasks.len());
                }
            }
        }
    }

    Ok(())
}
