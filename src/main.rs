use clap::{CommandFactory, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use timefiles::{Config, Database, OverviewRange, OverviewSnapshot, RestSuggestionView};

#[derive(Parser, Debug)]
#[command(name = "timefiles")]
#[command(
    author,
    version,
    about = "Local time tracking for hierarchical tasks"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize timefiles in the current directory
    Init,

    /// Create a new task
    Create {
        /// Title of the task
        title: String,

        /// Parent task id (creates a subtask)
        #[arg(short, long)]
        parent: Option<String>,
    },

    /// Rename a task
    Rename {
        /// Task id
        id: String,

        /// New title
        title: String,
    },

    /// Move a task under a new parent
    Reparent {
        /// Task id
        id: String,

        /// New parent id (omit to move to the root)
        #[arg(short, long)]
        parent: Option<String>,
    },

    /// Archive a task and its subtree (soft delete)
    Archive {
        /// Task id
        id: String,
    },

    /// Delete tasks and their subtrees
    Delete {
        /// Task ids
        ids: Vec<String>,

        /// Permanently remove rows and timing history (requires the tasks to
        /// be archived first)
        #[arg(long)]
        hard: bool,
    },

    /// Start timing a task (pauses the current runner)
    Start {
        /// Task id
        id: String,
    },

    /// Pause the running task
    Pause {
        /// Task id
        id: String,
    },

    /// Resume a paused task (pauses the current runner)
    Resume {
        /// Task id
        id: String,
    },

    /// Stop a running or paused task
    Stop {
        /// Task id
        id: String,
    },

    /// Create a subtask under the running task and switch to it
    Subtask {
        /// Running parent task id
        parent_id: String,

        /// Title of the new subtask
        title: String,
    },

    /// Manage task tags
    Tag {
        #[command(subcommand)]
        action: TagAction,
    },

    /// Inspect and answer rest suggestions
    Rest {
        #[command(subcommand)]
        action: RestAction,
    },

    /// Show one task in detail
    Show {
        /// Task id
        id: String,
    },

    /// Show all tasks with replayed durations
    Overview {
        /// Window: all, day, week, today
        #[arg(short, long, default_value = "all")]
        range: String,

        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the tail of the time event log
    Events {
        /// Number of events to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Liveness probe
    Ping,

    /// Start the JSON bridge for external viewers
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "4828")]
        port: u16,
    },

    /// Create a database backup
    Backup {
        /// Output path (default: timefiles_backup_<timestamp>.db)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate shell completions
    Completion {
        /// Shell type: bash, zsh, fish, powershell, elvish
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Debug)]
enum TagAction {
    /// Attach a tag to a task (creates the tag if needed)
    Add {
        /// Task id
        task_id: String,

        /// Tag name
        name: String,
    },

    /// Detach a tag from a task
    Remove {
        /// Task id
        task_id: String,

        /// Tag name
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum RestAction {
    /// Show the pending rest suggestion
    Show,

    /// List past suggestions, newest first
    History {
        /// Number of suggestions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Accept the pending suggestion
    Accept {
        /// Suggestion id
        id: i64,
    },

    /// Dismiss the pending suggestion
    Ignore {
        /// Suggestion id
        id: i64,
    },
}

/// Walk up the directory tree to find a .timefiles folder (like git finds
/// .git). Can be overridden with TIMEFILES_DB_PATH or the config file.
fn resolve_db_path(config: &Config) -> PathBuf {
    if let Ok(path) = std::env::var("TIMEFILES_DB_PATH") {
        return PathBuf::from(path);
    }

    if let Some(path) = &config.storage.path {
        return path.clone();
    }

    if let Ok(current_dir) = std::env::current_dir() {
        let mut dir = current_dir.as_path();
        loop {
            let timefiles_dir = dir.join(".timefiles");
            if timefiles_dir.is_dir() {
                return timefiles_dir.join("timefiles.db");
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }

    PathBuf::from(".timefiles/timefiles.db")
}

fn open_database(config: &Config) -> Database {
    let db_path = resolve_db_path(config);
    match Database::open_at(&db_path) {
        Ok(db) => {
            if !config.advisor.enabled {
                db.set_advisor_enabled(false);
            }
            db
        }
        Err(e) => {
            eprintln!("{} Failed to open database: {}", "Error:".red(), e);
            std::process::exit(1);
        }
    }
}

fn fail(e: impl std::fmt::Display) -> ! {
    eprintln!("{} {}", "Error:".red(), e);
    std::process::exit(1);
}

fn short_id(id: &str) -> &str {
    &id[..8.min(id.len())]
}

fn fmt_duration(seconds: i64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{}h{:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m{:02}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // Handle completion separately - doesn't need a database
    if let Command::Completion { shell } = args.command {
        clap_complete::generate(
            shell,
            &mut Args::command(),
            "timefiles",
            &mut std::io::stdout(),
        );
        return;
    }

    // Handle init separately - it creates the store instead of finding one
    if let Command::Init = args.command {
        let dir = PathBuf::from(".timefiles");
        if let Err(e) = std::fs::create_dir_all(&dir) {
            fail(format!("creating {}: {}", dir.display(), e));
        }
        let db_path = dir.join("timefiles.db");
        match Database::open_at(&db_path) {
            Ok(_) => println!("{} {}", "Initialized".green(), db_path.display()),
            Err(e) => fail(e),
        }
        return;
    }

    let config = Config::load();
    let db = open_database(&config);

    match args.command {
        Command::Init => unreachable!(),              // Handled above
        Command::Completion { .. } => unreachable!(), // Handled above

        Command::Create { title, parent } => match db.create_task(&title, parent.as_deref()) {
            Ok(id) => {
                let parent_str = parent
                    .as_ref()
                    .map(|p| format!(" under {}", short_id(p)))
                    .unwrap_or_default();
                println!("{} task {} ({}){}", "Created".green(), short_id(&id), title, parent_str);
                println!("  id: {}", id);
            }
            Err(e) => fail(e),
        },

        Command::Rename { id, title } => match db.rename_task(&id, &title) {
            Ok(()) => println!("{} task {} to '{}'", "Renamed".green(), short_id(&id), title),
            Err(e) => fail(e),
        },

        Command::Reparent { id, parent } => match db.reparent_task(&id, parent.as_deref()) {
            Ok(()) => match parent {
                Some(p) => println!("{} task {} under {}", "Moved".green(), short_id(&id), short_id(&p)),
                None => println!("{} task {} to the root", "Moved".green(), short_id(&id)),
            },
            Err(e) => fail(e),
        },

        Command::Archive { id } => match db.archive_task(&id) {
            Ok(()) => println!("{} task {} and its subtree", "Archived".yellow(), short_id(&id)),
            Err(e) => fail(e),
        },

        Command::Delete { ids, hard } => match db.delete_tasks(&ids, hard) {
            Ok(()) => {
                let verb = if hard { "Deleted" } else { "Archived" };
                println!("{} {} task tree(s)", verb.yellow(), ids.len());
            }
            Err(e) => fail(e),
        },

        Command::Start { id } => match db.start_task(&id) {
            Ok(()) => {
                println!("{} task {}", "Started".green(), short_id(&id));
                show_pending_suggestion(&db);
            }
            Err(e) => fail(e),
        },

        Command::Pause { id } => match db.pause_task(&id) {
            Ok(()) => println!("{} task {}", "Paused".yellow(), short_id(&id)),
            Err(e) => fail(e),
        },

        Command::Resume { id } => match db.resume_task(&id) {
            Ok(()) => {
                println!("{} task {}", "Resumed".green(), short_id(&id));
                show_pending_suggestion(&db);
            }
            Err(e) => fail(e),
        },

        Command::Stop { id } => match db.stop_task(&id) {
            Ok(()) => {
                println!("{} task {}", "Stopped".yellow(), short_id(&id));
                show_pending_suggestion(&db);
            }
            Err(e) => fail(e),
        },

        Command::Subtask { parent_id, title } => {
            match db.insert_subtask_and_start(&parent_id, &title) {
                Ok(child_id) => {
                    println!(
                        "{} subtask {} ({}) under {}; timer switched",
                        "Started".green(),
                        short_id(&child_id),
                        title,
                        short_id(&parent_id)
                    );
                    println!("  id: {}", child_id);
                    show_pending_suggestion(&db);
                }
                Err(e) => fail(e),
            }
        }

        Command::Tag { action } => match action {
            TagAction::Add { task_id, name } => match db.add_tag_to_task(&task_id, &name) {
                Ok(()) => println!("{} tag '{}' to task {}", "Added".green(), name, short_id(&task_id)),
                Err(e) => fail(e),
            },
            TagAction::Remove { task_id, name } => {
                match db.remove_tag_from_task(&task_id, &name) {
                    Ok(()) => println!(
                        "{} tag '{}' from task {}",
                        "Removed".yellow(),
                        name,
                        short_id(&task_id)
                    ),
                    Err(e) => fail(e),
                }
            }
        },

        Command::Rest { action } => match action {
            RestAction::Show => match db.pending_rest_suggestion() {
                Ok(Some(suggestion)) => print_suggestion(&suggestion),
                Ok(None) => println!("No pending rest suggestion."),
                Err(e) => fail(e),
            },
            RestAction::History { limit } => match db.rest_suggestions() {
                Ok(suggestions) => {
                    if suggestions.is_empty() {
                        println!("No rest suggestions recorded yet.");
                    } else {
                        println!("{:<6} {:<12} {:<10} {:>8} {:>9}  RULES", "ID", "TRIGGER", "STATUS", "MINUTES", "FOCUS");
                        println!("{}", "-".repeat(64));
                        for suggestion in suggestions.iter().take(limit) {
                            println!(
                                "{:<6} {:<12} {:<10} {:>8} {:>9}  {}",
                                suggestion.id,
                                suggestion.trigger_type,
                                suggestion.status,
                                suggestion.suggested_minutes,
                                fmt_duration(suggestion.focus_seconds),
                                suggestion.reasons.join(", ")
                            );
                        }
                    }
                }
                Err(e) => fail(e),
            },
            RestAction::Accept { id } => match db.respond_rest_suggestion(id, true) {
                Ok(()) => println!("{} rest suggestion {}", "Accepted".green(), id),
                Err(e) => fail(e),
            },
            RestAction::Ignore { id } => match db.respond_rest_suggestion(id, false) {
                Ok(()) => println!("{} rest suggestion {}", "Ignored".yellow(), id),
                Err(e) => fail(e),
            },
        },

        Command::Show { id } => {
            let task = match db.get_task(&id) {
                Ok(Some(task)) => task,
                Ok(None) => fail(format!("task {} not found", id)),
                Err(e) => fail(e),
            };
            println!("{}", format!("Task {}:", task.id).cyan());
            println!("  title:    {}", task.title);
            println!("  status:   {}", task.status);
            if let Some(parent) = &task.parent_id {
                println!("  parent:   {}", parent);
            }
            println!("  created:  {}", task.created_at);
            if let Some(archived_at) = task.archived_at {
                println!("  archived: {}", archived_at);
            }
            match db.get_overview(OverviewRange::All) {
                Ok(snapshot) => {
                    if let Some(view) = snapshot.tasks.iter().find(|t| t.id == task.id) {
                        if !view.tags.is_empty() {
                            println!("  tags:     {}", view.tags.join(", "));
                        }
                        println!("  tracked:  {} ({} with subtasks)",
                            fmt_duration(view.exclusive_seconds),
                            fmt_duration(view.inclusive_seconds));
                    }
                }
                Err(e) => fail(e),
            }
            match db.task_events(&id) {
                Ok(events) if !events.is_empty() => {
                    println!("  events:");
                    let tail_from = events.len().saturating_sub(10);
                    for event in &events[tail_from..] {
                        println!("    #{:<6} {:<12} at {}", event.sequence, event.kind, event.at);
                    }
                }
                Ok(_) => {}
                Err(e) => fail(e),
            }
        }

        Command::Overview { range, json } => {
            let range = match range.parse::<OverviewRange>() {
                Ok(range) => range,
                Err(e) => fail(e),
            };
            match db.get_overview(range) {
                Ok(snapshot) => {
                    if json {
                        match serde_json::to_string_pretty(&snapshot) {
                            Ok(text) => println!("{}", text),
                            Err(e) => fail(format!("serializing snapshot: {}", e)),
                        }
                    } else {
                        print_overview(&snapshot);
                    }
                }
                Err(e) => fail(e),
            }
        }

        Command::Events { limit } => match db.event_log() {
            Ok(events) => {
                if events.is_empty() {
                    println!("No events recorded. Start a task with: timefiles start <id>");
                } else {
                    let tail_from = events.len().saturating_sub(limit);
                    println!("{:<8} {:<12} {:<12} {:<10} PAYLOAD", "SEQ", "AT", "KIND", "TASK");
                    println!("{}", "-".repeat(70));
                    for event in &events[tail_from..] {
                        println!(
                            "{:<8} {:<12} {:<12} {:<10} {}",
                            event.sequence,
                            event.at,
                            event.kind,
                            short_id(&event.task_id),
                            event.payload.as_deref().unwrap_or("")
                        );
                    }
                }
            }
            Err(e) => fail(e),
        },

        Command::Ping => match db.ping() {
            Ok(answer) => println!("{}", answer),
            Err(e) => fail(e),
        },

        Command::Serve { port } => {
            if let Err(e) = timefiles::serve::start_bridge(&db, port) {
                fail(e);
            }
        }

        Command::Backup { output } => {
            let source = resolve_db_path(&config);
            let target = output.unwrap_or_else(|| {
                let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
                PathBuf::from(format!("timefiles_backup_{}.db", stamp))
            });
            match std::fs::copy(&source, &target) {
                Ok(_) => println!("{} backup at {}", "Created".green(), target.display()),
                Err(e) => fail(format!("copying {}: {}", source.display(), e)),
            }
        }
    }
}

fn show_pending_suggestion(db: &Database) {
    if let Ok(Some(suggestion)) = db.pending_rest_suggestion() {
        if suggestion.suggested_minutes > 0 {
            println!(
                "{} consider a {} minute break (suggestion {})",
                "Rest:".cyan(),
                suggestion.suggested_minutes,
                suggestion.id
            );
        }
    }
}

fn print_suggestion(suggestion: &RestSuggestionView) {
    println!("{}", format!("Rest suggestion {}:", suggestion.id).cyan());
    println!("  trigger:    {}", suggestion.trigger_type);
    if let Some(task_id) = &suggestion.task_id {
        println!("  task:       {}", short_id(task_id));
    }
    println!("  focus:      {}", fmt_duration(suggestion.focus_seconds));
    println!("  switches:   {} in the last 30m", suggestion.switch_count_30m);
    println!("  suggestion: {} minute(s)", suggestion.suggested_minutes);
    if !suggestion.reasons.is_empty() {
        println!("  rules:      {}", suggestion.reasons.join(", "));
    }
    println!(
        "\nRespond with: timefiles rest accept {0}  |  timefiles rest ignore {0}",
        suggestion.id
    );
}

fn print_overview(snapshot: &OverviewSnapshot) {
    if snapshot.tasks.is_empty() {
        println!("No tasks yet. Create one with: timefiles create \"My task\"");
        return;
    }

    println!(
        "{}",
        format!("{} tasks ({} window):", snapshot.tasks.len(), snapshot.range).cyan()
    );
    println!(
        "{:<10} {:<9} {:>9} {:>9}  TITLE",
        "ID", "STATUS", "EXCL", "INCL"
    );
    println!("{}", "-".repeat(70));
    for task in &snapshot.tasks {
        let active_marker = if snapshot.active_task_id.as_deref() == Some(task.id.as_str()) {
            "*"
        } else {
            " "
        };
        let status_colored = match task.status.as_str() {
            "running" => task.status.green(),
            "paused" => task.status.yellow(),
            "stopped" => task.status.blue(),
            _ => task.status.white(),
        };
        let depth_indent = "  ".repeat(depth_of(snapshot, &task.id));
        let tag_suffix = if task.tags.is_empty() {
            String::new()
        } else {
            format!("  [{}]", task.tags.join(", "))
        };
        println!(
            "{:<10} {:<9} {:>9} {:>9} {}{}{}{}",
            short_id(&task.id),
            status_colored,
            fmt_duration(task.exclusive_seconds),
            fmt_duration(task.inclusive_seconds),
            active_marker,
            depth_indent,
            task.title,
            tag_suffix
        );
    }

    if let Some(suggestion) = &snapshot.rest_suggestion {
        println!();
        print_suggestion(suggestion);
    }
}

fn depth_of(snapshot: &OverviewSnapshot, task_id: &str) -> usize {
    let mut depth = 0;
    let mut current = task_id;
    while let Some(task) = snapshot.tasks.iter().find(|t| t.id == current) {
        match &task.parent_id {
            Some(parent) => {
                depth += 1;
                current = parent;
                if depth > snapshot.tasks.len() {
                    break;
                }
            }
            None => break,
        }
    }
    depth
}
