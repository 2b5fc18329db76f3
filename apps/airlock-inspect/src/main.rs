use proxy_core::FetchTaskStore;
use proxy_store::SqliteTaskStore;
use tracing::debug;

mod config;
mod logging;

fn main() {
    logging::init();

    let config = match config::InspectConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            eprintln!("Required: AIRLOCK_SERVER_NAME and AIRLOCK_USER_ID");
            std::process::exit(1);
        }
    };
    debug!(store_path = %config.store_path.display(), "opening task store");

    let store = match SqliteTaskStore::open(&config.store_path) {
        Ok(store) => store,
        Err(err) => {
            eprintln!("Failed to open task store: {err}");
            std::process::exit(1);
        }
    };

    let tasks = match store.load_fetch_tasks(&config.server_name, &config.user_id) {
        Ok(tasks) => tasks,
        Err(err) => {
            eprintln!("Failed to load fetch tasks: {err}");
            std::process::exit(1);
        }
    };

    if tasks.is_empty() {
        println!(
            "No pending backfill tasks for {} on {}.",
            config.user_id, config.server_name
        );
        return;
    }

    for task in &tasks {
        match serde_json::to_string(task) {
            Ok(line) => println!("{line}"),
            Err(err) => {
                eprintln!("Failed to encode task for {}: {err}", task.room_id);
                std::process::exit(1);
            }
        }
    }
    println!("{} pending backfill task(s).", tasks.len());
}
