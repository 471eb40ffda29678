use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{Local, NaiveDate};
use clap::{ArgGroup, Parser, Subcommand};
use dotenv::dotenv;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod admin;
mod config;
mod db;
mod errors;
mod leaderboard;
mod models;
mod progress;
mod report;
mod scoring;
mod state;
mod store;
mod subscriptions;

use config::{AppConfig, LogFormat};
use errors::ScoringError;
use leaderboard::{Leaderboard, LeaderboardLimits};
use models::{AbsenceKind, CriteriaKey, Level, ScoreKind};
use state::ScoreboardState;
use store::memory::MemoryStore;
use store::postgres::PgDocumentStore;
use store::{collection, query, Document, DocumentStore, GROUPS, SCORES};
use subscriptions::{on_snapshot, SubscriptionRegistry, View};

#[derive(Parser)]
#[command(name = "competition-scoreboard")]
#[command(about = "Points, leaderboards and weekly reports for school competitions", long_about = None)]
struct Cli {
    /// Run against a fresh in-memory store loaded with demo data
    #[arg(long, global = true)]
    memory: bool,
    /// School level the command works on
    #[arg(long, global = true, value_enum, default_value_t = Level::Middle)]
    level: Level,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load demo students, a competition, a group and a few scores
    Seed,
    /// Register a student at the selected level
    AddStudent {
        name: String,
        /// Parent phone; also used as the student number
        #[arg(long)]
        phone: Option<String>,
        #[arg(long, default_value = "")]
        icon: String,
        #[arg(long, default_value = "")]
        memorization_plan: String,
        #[arg(long, default_value = "")]
        review_plan: String,
    },
    /// Replace a student's profile
    EditStudent {
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long, default_value = "")]
        icon: String,
        #[arg(long, default_value = "")]
        memorization_plan: String,
        #[arg(long, default_value = "")]
        review_plan: String,
    },
    /// Import students from a CSV with name,student_number,icon columns
    ImportStudents {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Move a student to another level
    TransferStudent {
        id: String,
        #[arg(long, value_enum)]
        to: Level,
    },
    DeleteStudent {
        id: String,
    },
    AddTeacher {
        name: String,
        #[arg(long)]
        phone: String,
    },
    ListTeachers,
    DeleteTeacher {
        id: String,
    },
    /// Create a competition, or edit one with --id
    SaveCompetition {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        name: String,
        /// Criterion as name:positive:negative, repeatable
        #[arg(long = "criterion")]
        criteria: Vec<String>,
        /// Open the competition to every level
        #[arg(long)]
        general: bool,
        #[arg(long, default_value = "")]
        icon: String,
        #[arg(long)]
        absent_excuse: Option<i64>,
        #[arg(long)]
        absent_no_excuse: Option<i64>,
        #[arg(long)]
        activity_points: Option<i64>,
        #[arg(long)]
        activity_absent_points: Option<i64>,
    },
    /// Activate or deactivate a competition for the selected level
    ToggleActive {
        id: String,
    },
    DeleteCompetition {
        id: String,
    },
    /// Delete every score of a competition
    ResetCompetition {
        id: String,
    },
    /// Create a group, or edit one with --id
    SaveGroup {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        name: String,
        #[arg(long)]
        competition: String,
        #[arg(long = "member")]
        members: Vec<String>,
        #[arg(long)]
        leader: Option<String>,
        #[arg(long)]
        deputy: Option<String>,
        #[arg(long, default_value = "")]
        icon: String,
    },
    DeleteGroup {
        id: String,
    },
    /// Grade a student on one criterion
    Score {
        #[arg(long)]
        student: String,
        #[arg(long)]
        competition: String,
        #[arg(long)]
        criterion: String,
        /// Apply the criterion's deduction instead of its reward
        #[arg(long)]
        negative: bool,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Record an absence
    Absence {
        #[arg(long)]
        student: String,
        #[arg(long)]
        competition: String,
        #[arg(long, value_enum)]
        kind: AbsenceKind,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Record an activity day for a whole group
    ActivityDay {
        #[arg(long)]
        group: String,
        #[arg(long = "absent")]
        absent: Vec<String>,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Show the ranked students and groups
    Leaderboard {
        #[arg(long)]
        json: bool,
    },
    /// Keep the leaderboard live until interrupted
    Watch,
    /// Weekly report for a student or a group
    #[command(group(
        ArgGroup::new("scope")
            .args(["student", "group"])
            .required(true)
            .multiple(false)
    ))]
    WeeklyReport {
        #[arg(long)]
        student: Option<String>,
        #[arg(long)]
        group: Option<String>,
        /// Defaults to the level's active competition
        #[arg(long)]
        competition: Option<String>,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Look up children by parent phone and show their progress
    Parent {
        phone: String,
    },
}

fn init_tracing(config: &AppConfig) {
    let filter =
        EnvFilter::try_new(&config.app.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.app.log_format {
        LogFormat::Pretty => builder.with_target(false).init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn open_store(
    cli: &Cli,
    config: &AppConfig,
) -> anyhow::Result<Arc<dyn DocumentStore>> {
    if cli.memory {
        let store = MemoryStore::new();
        db::seed(&store).await.context("failed to seed the in-memory store")?;
        info!("using in-memory store with demo data");
        return Ok(Arc::new(store));
    }

    anyhow::ensure!(
        !config.database.url.is_empty(),
        "DATABASE_URL must be set to a Postgres instance (or pass --memory)"
    );
    let store = PgDocumentStore::connect(&config.database.url, config.database.max_connections)
        .await
        .context("failed to connect to Postgres")?;
    if matches!(cli.command, Commands::InitDb) {
        store.migrate().await.context("failed to migrate schema")?;
    }
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load().context("failed to load configuration")?;
    init_tracing(&config);

    let store = open_store(&cli, &config).await?;
    let limits = config.leaderboard_limits();

    let outcome = match cli.command {
        Commands::Watch => watch(store, cli.level, limits).await,
        command => {
            let secs = config.store.timeout_secs;
            match tokio::time::timeout(
                Duration::from_secs(secs),
                run(command, store.as_ref(), cli.level, limits),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ScoringError::Timeout(secs).into()),
            }
        }
    };

    match outcome {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => match err.downcast_ref::<ScoringError>() {
            Some(rejection) if rejection.is_rejection() => {
                println!("Rejected: {rejection}");
                Ok(ExitCode::from(2))
            }
            _ => {
                error!(error = %err, "command failed");
                Err(err)
            }
        },
    }
}

fn today_or(date: Option<NaiveDate>) -> NaiveDate {
    date.unwrap_or_else(|| Local::now().date_naive())
}

async fn require_competition(
    store: &dyn DocumentStore,
    id: &str,
) -> anyhow::Result<models::Competition> {
    Ok(db::get_competition(store, id)
        .await?
        .ok_or_else(|| ScoringError::NotFound(format!("competition {id}")))?)
}

async fn score_entry(
    store: &dyn DocumentStore,
    student_id: &str,
    competition_id: &str,
    criteria: CriteriaKey,
    criteria_name: String,
    kind: ScoreKind,
    date: NaiveDate,
) -> anyhow::Result<scoring::ScoreEntry> {
    let student = db::get_student(store, student_id)
        .await?
        .ok_or_else(|| ScoringError::NotFound(format!("student {student_id}")))?;
    let group_id = db::groups_containing(store, student_id)
        .await?
        .into_iter()
        .find(|group| group.competition_id == competition_id)
        .map(|group| group.id);

    Ok(scoring::ScoreEntry {
        student_id: student.id,
        competition_id: competition_id.to_string(),
        group_id,
        criteria,
        criteria_name,
        kind,
        date,
        level: Some(student.level),
    })
}

async fn run(
    command: Commands,
    store: &dyn DocumentStore,
    level: Level,
    limits: LeaderboardLimits,
) -> anyhow::Result<()> {
    match command {
        Commands::InitDb => {
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(store).await?;
            println!("Seed data inserted.");
        }
        Commands::AddStudent {
            name,
            phone,
            icon,
            memorization_plan,
            review_plan,
        } => {
            let draft = admin::StudentDraft {
                phone,
                icon,
                memorization_plan,
                review_plan,
                ..admin::StudentDraft::new(&name, level)
            };
            let student = admin::add_student(store, draft).await?;
            println!("Added student {} ({}).", student.name, student.id);
        }
        Commands::EditStudent {
            id,
            name,
            phone,
            icon,
            memorization_plan,
            review_plan,
        } => {
            let current = db::get_student(store, &id)
                .await?
                .ok_or_else(|| ScoringError::NotFound(format!("student {id}")))?;
            let draft = admin::StudentDraft {
                phone,
                icon,
                memorization_plan,
                review_plan,
                ..admin::StudentDraft::new(&name, current.level)
            };
            let student = admin::update_student(store, &id, draft).await?;
            println!("Updated student {}.", student.name);
        }
        Commands::ImportStudents { csv } => {
            let inserted = admin::import_students_csv(store, &csv, level).await?;
            println!("Imported {inserted} students from {}.", csv.display());
        }
        Commands::TransferStudent { id, to } => {
            admin::transfer_student(store, &id, to).await?;
            println!("Moved student {id} to {to}.");
        }
        Commands::DeleteStudent { id } => {
            admin::delete_student(store, &id).await?;
            println!("Deleted student {id}.");
        }
        Commands::AddTeacher { name, phone } => {
            let teacher = admin::add_teacher(store, &name, &phone, level).await?;
            println!("Added teacher {} ({}).", teacher.name, teacher.id);
        }
        Commands::ListTeachers => {
            let teachers = db::teachers_by_level(store, level).await?;
            if teachers.is_empty() {
                println!("No teachers registered for {level}.");
            }
            for teacher in teachers {
                println!("- {} {} ({})", teacher.name, teacher.phone, teacher.id);
            }
        }
        Commands::DeleteTeacher { id } => {
            admin::delete_teacher(store, &id).await?;
            println!("Deleted teacher {id}.");
        }
        Commands::SaveCompetition {
            id,
            name,
            criteria,
            general,
            icon,
            absent_excuse,
            absent_no_excuse,
            activity_points,
            activity_absent_points,
        } => {
            let criteria = criteria
                .iter()
                .map(|raw| admin::parse_criterion(raw))
                .collect::<errors::Result<Vec<_>>>()?;
            let draft = admin::CompetitionDraft {
                id,
                name,
                level: (!general).then_some(level),
                icon,
                criteria,
                absent_excuse,
                absent_no_excuse,
                activity_points,
                activity_absent_points,
            };
            let competition = admin::save_competition(store, draft).await?;
            println!(
                "Saved competition {} ({}) with {} criteria.",
                competition.name,
                competition.id,
                competition.criteria.len()
            );
        }
        Commands::ToggleActive { id } => {
            let active = admin::toggle_competition_active(store, level, &id).await?;
            let state = if active { "active" } else { "inactive" };
            println!("Competition {id} is now {state}.");
        }
        Commands::DeleteCompetition { id } => {
            admin::delete_competition(store, &id).await?;
            println!("Deleted competition {id}. Its scores and groups were kept.");
        }
        Commands::ResetCompetition { id } => {
            require_competition(store, &id).await?;
            let deleted = scoring::reset_competition(store, &id).await?;
            println!("Deleted {deleted} scores from competition {id}.");
        }
        Commands::SaveGroup {
            id,
            name,
            competition,
            members,
            leader,
            deputy,
            icon,
        } => {
            let draft = admin::GroupDraft {
                id,
                name,
                competition_id: competition,
                level: Some(level),
                icon,
                leader,
                deputy,
                members,
            };
            let group = admin::save_group(store, draft).await?;
            println!(
                "Saved group {} ({}) with {} members.",
                group.name,
                group.id,
                group.members.len()
            );
        }
        Commands::DeleteGroup { id } => {
            admin::delete_group(store, &id).await?;
            println!("Deleted group {id}.");
        }
        Commands::Score {
            student,
            competition,
            criterion,
            negative,
            date,
        } => {
            let competition = require_competition(store, &competition).await?;
            let found = competition.criterion(&criterion).ok_or_else(|| {
                ScoringError::NotFound(format!(
                    "criterion {criterion} in competition {}",
                    competition.name
                ))
            })?;
            let (kind, points) = if negative {
                (
                    ScoreKind::Negative,
                    found.negative_points.saturating_abs().saturating_neg(),
                )
            } else {
                (ScoreKind::Positive, found.positive_points)
            };
            let entry = score_entry(
                store,
                &student,
                &competition.id,
                CriteriaKey::Criterion(found.id.clone()),
                found.name.clone(),
                kind,
                today_or(date),
            )
            .await?;
            let score = scoring::record_score(store, entry, points).await?;
            println!(
                "{} on {}: {} points for {}.",
                score.criteria_name, score.date, score.points, student
            );
        }
        Commands::Absence {
            student,
            competition,
            kind,
            date,
        } => {
            let competition = require_competition(store, &competition).await?;
            let entry = score_entry(
                store,
                &student,
                &competition.id,
                CriteriaKey::Absence,
                kind.label().to_string(),
                ScoreKind::Negative,
                today_or(date),
            )
            .await?;
            let score = scoring::record_absence(store, entry, &competition, kind).await?;
            println!(
                "{} on {}: {} points for {}.",
                score.criteria_name, score.date, score.points, student
            );
        }
        Commands::ActivityDay { group, absent, date } => {
            let group = db::get_group(store, &group)
                .await?
                .ok_or_else(|| ScoringError::NotFound(format!("group {group}")))?;
            let competition = require_competition(store, &group.competition_id).await?;
            let outcome = scoring::record_activity_day(
                store,
                &competition,
                &group,
                today_or(date),
                &absent,
                group.level,
            )
            .await?;
            println!(
                "Activity day {} for {}: {} present, {} absent.",
                outcome.activity_day.date, group.name, outcome.present, outcome.absent
            );
        }
        Commands::Leaderboard { json } => {
            let state = ScoreboardState::load(store, level).await?;
            let board = state.leaderboard(limits);
            if json {
                println!("{}", serde_json::to_string_pretty(&board)?);
            } else {
                print_leaderboard(&board, state.active_competition());
            }
        }
        Commands::Watch => anyhow::bail!("watch runs until interrupted and is started separately"),
        Commands::WeeklyReport {
            student,
            group,
            competition,
            date,
            out,
        } => {
            let competition = match competition {
                Some(id) => require_competition(store, &id).await?,
                None => ScoreboardState::load(store, level)
                    .await?
                    .active_competition()
                    .cloned()
                    .ok_or_else(|| {
                        ScoringError::Validation(format!("no active competition for {level}"))
                    })?,
            };
            let today = today_or(date);

            let (title, totals) = match (student, group) {
                (Some(student_id), _) => {
                    let student = db::get_student(store, &student_id)
                        .await?
                        .ok_or_else(|| ScoringError::NotFound(format!("student {student_id}")))?;
                    let totals =
                        report::student_weekly_report(store, &student.id, &competition, today)
                            .await?;
                    (student.name, totals)
                }
                (None, Some(group_id)) => {
                    let group = db::get_group(store, &group_id)
                        .await?
                        .ok_or_else(|| ScoringError::NotFound(format!("group {group_id}")))?;
                    let totals =
                        report::group_weekly_report(store, &group, &competition, today).await?;
                    (group.name, totals)
                }
                (None, None) => anyhow::bail!("pass --student or --group"),
            };

            let markdown = report::render_markdown(&title, &totals);
            match out {
                Some(path) => {
                    std::fs::write(&path, markdown)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("Report written to {}.", path.display());
                }
                None => print!("{markdown}"),
            }
        }
        Commands::Parent { phone } => {
            for child in progress::find_children(store, &phone).await? {
                let progress = progress::student_progress(store, &child.id).await?;
                print_progress(&progress);
            }
        }
    }

    Ok(())
}

fn print_leaderboard(board: &Leaderboard, active: Option<&models::Competition>) {
    match active {
        Some(competition) => println!("Leaderboard for {}", competition.name),
        None => println!("Leaderboard (no active competition, all scores)"),
    }
    if board.students.is_empty() {
        println!("No students at this level.");
        return;
    }

    println!("Top students:");
    for (rank, standing) in board.top_students().iter().enumerate() {
        println!("{}. {} {} pts", rank + 1, standing.name, standing.total);
    }
    if !board.groups.is_empty() {
        println!("Top groups:");
        for (rank, standing) in board.top_groups().iter().enumerate() {
            println!(
                "{}. {} {} pts across {} members",
                rank + 1,
                standing.name,
                standing.total,
                standing.member_count
            );
        }
    }
}

fn print_progress(progress: &progress::StudentProgress) {
    let summary = &progress.summary;
    println!("{} ({})", progress.student.name, progress.student.level);
    if let Some(group) = &progress.group_name {
        println!("Group: {group}");
    }
    println!("Total points: {}", summary.total_points);
    println!(
        "Absences: {} ({} excused, {} unexcused)",
        summary.absence_days(),
        summary.excused_absences.len(),
        summary.unexcused_absences.len()
    );
    for (name, stats) in &summary.criteria {
        println!(
            "- {name}: +{} / {} across {} entries",
            stats.positive, stats.negative, stats.count
        );
    }
    for teacher in &progress.teachers {
        println!("Teacher: {} {}", teacher.name, teacher.phone);
    }
    println!();
}

async fn watch(
    store: Arc<dyn DocumentStore>,
    level: Level,
    limits: LeaderboardLimits,
) -> anyhow::Result<()> {
    let mut state = ScoreboardState::new(level);
    let mut registry = SubscriptionRegistry::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, Vec<Document>)>();

    let queries = [
        db::students_query(level),
        db::competitions_query(level),
        query(&collection(GROUPS)),
        query(&collection(SCORES)),
    ];
    let subs = queries
        .into_iter()
        .map(|watched| {
            let tx = tx.clone();
            let name = watched.collection.clone();
            on_snapshot(store.clone(), watched, move |docs| {
                let _ = tx.send((name.clone(), docs));
            })
        })
        .collect();
    registry.replace(View::Home, subs);
    drop(tx);

    info!(%level, "watching leaderboard, press ctrl-c to stop");
    loop {
        tokio::select! {
            update = rx.recv() => {
                let Some((collection, docs)) = update else { break };
                state.apply(&collection, &docs);
                print_leaderboard(&state.leaderboard(limits), state.active_competition());
                println!();
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    registry.teardown_all();
    Ok(())
}
