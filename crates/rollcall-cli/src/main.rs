use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use rollcall_core::{FaceDetector, FaceTemplate, Identity};
use rollcall_hw::Camera;
use rollcall_store::AttendanceStore;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance administration CLI")]
struct Cli {
    /// Path to the SQLite database (default: $XDG_DATA_HOME/rollcall/attendance.db)
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a student from a photo
    Enroll {
        /// Student id (e.g., "S042")
        id: String,
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Department
        #[arg(short, long)]
        department: String,
        /// Year of study
        #[arg(short, long)]
        year: String,
        /// Section
        #[arg(short, long)]
        section: String,
        /// Photo containing the student's face
        #[arg(short, long)]
        photo: PathBuf,
        /// Directory containing the cascade model file
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// List enrolled students
    List,
    /// Remove an enrolled student
    Remove {
        /// Student id to remove
        id: String,
    },
    /// Show attendance for a date (default: today)
    Attendance {
        /// Date as YYYY-MM-DD
        date: Option<String>,
    },
    /// List available camera devices
    Devices,
}

fn default_db_path() -> PathBuf {
    std::env::var("ROLLCALL_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let data_dir = std::env::var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                    PathBuf::from(home).join(".local/share")
                });
            data_dir.join("rollcall/attendance.db")
        })
}

fn default_model_dir() -> PathBuf {
    std::env::var("ROLLCALL_MODEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/usr/share/rollcall/models"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(default_db_path);

    match cli.command {
        Commands::Enroll {
            id,
            name,
            department,
            year,
            section,
            photo,
            model_dir,
        } => {
            let store = AttendanceStore::open(&db_path)?;
            let identity = Identity {
                student_id: id,
                display_name: name,
                department,
                year,
                section,
            };
            let template = template_from_photo(&photo, &model_dir.unwrap_or_else(default_model_dir))?;
            store.enroll(&identity, &template)?;
            println!(
                "Enrolled {} ({}) from {}",
                identity.student_id,
                identity.display_name,
                photo.display()
            );
        }
        Commands::List => {
            let store = AttendanceStore::open(&db_path)?;
            let students = store.students()?;
            if students.is_empty() {
                println!("No students enrolled");
            } else {
                println!("{:<10} {:<24} {:<12} {:<5} {:<7}", "ID", "NAME", "DEPT", "YEAR", "SECTION");
                for s in &students {
                    println!(
                        "{:<10} {:<24} {:<12} {:<5} {:<7}",
                        s.student_id, s.display_name, s.department, s.year, s.section
                    );
                }
                println!("{} student(s)", students.len());
            }
        }
        Commands::Remove { id } => {
            let store = AttendanceStore::open(&db_path)?;
            store.remove_student(&id)?;
            println!("Removed {id}");
        }
        Commands::Attendance { date } => {
            let date = match date {
                Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                    .with_context(|| format!("invalid date: {raw} (expected YYYY-MM-DD)"))?,
                None => Local::now().date_naive(),
            };
            let store = AttendanceStore::open(&db_path)?;
            let records = store.attendance_on(date)?;
            if records.is_empty() {
                println!("No attendance recorded on {date}");
            } else {
                println!("{:<10} {:<24} {:<12} {:<10} {:<8}", "ID", "NAME", "DEPT", "TIME", "STATUS");
                for r in &records {
                    println!(
                        "{:<10} {:<24} {:<12} {:<10} {:<8}",
                        r.student_id, r.display_name, r.department, r.time, r.status
                    );
                }
                println!("{} present on {date}", records.len());
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found");
            }
            for d in &devices {
                println!("{}  {} ({})", d.path, d.name, d.driver);
            }
        }
    }

    Ok(())
}

/// Detect the largest face in the photo and cut the match template from it.
fn template_from_photo(photo: &PathBuf, model_dir: &PathBuf) -> Result<FaceTemplate> {
    let model_path = model_dir.join("frontalface.json");
    let detector = FaceDetector::load(&model_path.to_string_lossy())
        .with_context(|| format!("failed to load cascade model from {}", model_path.display()))?;

    let image = image::open(photo)
        .with_context(|| format!("failed to open photo {}", photo.display()))?
        .to_luma8();
    let (width, height) = image.dimensions();

    let faces = detector.detect(image.as_raw(), width, height);
    let Some(face) = faces.iter().max_by_key(|f| f.width * f.height) else {
        bail!("no face detected in {}", photo.display());
    };
    if faces.len() > 1 {
        println!("{} faces detected; using the largest", faces.len());
    }

    FaceTemplate::from_region(image.as_raw(), width, height, face)
        .context("failed to extract face template")
}
