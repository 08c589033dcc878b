use anyhow::{Context, Result};
use clap::Parser;
use narrator::{
    config::NarratorConfig,
    job::{load_all_jobs, Job, JobStatus, VideoType},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io::stdout;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use humansize::{format_size, DECIMAL};

struct App {
    jobs: Vec<Job>,
    system: System,
    table_state: TableState,
    should_quit: bool,
    store_dir: PathBuf,
    max_jobs: usize,
}

impl App {
    fn new(store_dir: PathBuf, max_jobs: usize) -> Self {
        Self {
            jobs: Vec::new(),
            system: System::new(),
            table_state: TableState::default(),
            should_quit: false,
            store_dir,
            max_jobs,
        }
    }

    fn refresh(&mut self) -> Result<()> {
        // Refresh system info
        self.system.refresh_all();

        // Reload jobs straight from the job records on disk
        match load_all_jobs(&self.store_dir) {
            Ok(jobs) => {
                self.jobs = jobs;
                // newest first
                self.jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            }
            Err(_e) => {
                // an unreadable store shows as an empty table
                self.jobs = Vec::new();
            }
        }

        Ok(())
    }

    /// Number of loaded jobs in `status`
    fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    /// Share of processing slots in use, 0-100
    fn queue_usage(&self) -> f64 {
        let processing = self.count_by_status(JobStatus::Processing) as f64;
        (processing / self.max_jobs.max(1) as f64 * 100.0).clamp(0.0, 100.0)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load config - if no config specified, try default location first (same as daemon)
    // Store default path in a variable that lives long enough
    let default_config_path = PathBuf::from("/etc/narrator/config.toml");

    let config_path = if let Some(ref path) = args.config {
        Some(path.as_path())
    } else if default_config_path.exists() {
        Some(default_config_path.as_path())
    } else {
        None
    };

    let cfg = NarratorConfig::load_config(config_path)
        .context("Failed to load configuration")?;

    // Setup terminal
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Create app
    let mut app = App::new(cfg.store_dir.clone(), cfg.api.max_jobs);

    // Main event loop
    loop {
        // Refresh data
        app.refresh()?;

        // Draw UI
        terminal.draw(|f| ui(f, &mut app))?;

        // Handle input, waking at least every 250ms to redraw
        if crossterm::event::poll(Duration::from_millis(250))? {
            if let crossterm::event::Event::Key(key) = crossterm::event::read()? {
                match key.code {
                    crossterm::event::KeyCode::Char('q') => {
                        app.should_quit = true;
                    }
                    crossterm::event::KeyCode::Char('r') => {
                        app.refresh()?;
                    }
                    _ => {}
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    // Restore terminal
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    Ok(())
}

/// Narrator job monitor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    // Check minimum terminal size
    if size.height < 10 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x10.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    // Fixed top and bottom bars, the job table takes whatever is left
    let top_height = 3;
    let bottom_height = 3;
    let available_height = size.height.saturating_sub(top_height + bottom_height);

    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(top_height),       // gauges
            Constraint::Length(available_height), // job table
            Constraint::Length(bottom_height),    // status bar
        ])
        .split(size);

    // Render each section in its allocated area
    render_top_bar(f, app, main_chunks[0]);
    render_job_table(f, app, main_chunks[1]);
    render_status_bar(f, app, main_chunks[2]);
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() || value.is_infinite() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    // Split top bar into three parts for CPU, Memory, and Queue
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(33),
            Constraint::Percentage(34),
            Constraint::Percentage(33),
        ])
        .split(area);

    // Get CPU usage and clamp to 0-100 range
    let cpu_usage = clamp_percent(app.system.global_cpu_usage() as f64);

    // Get memory usage and clamp to 0-100 range
    let total_memory = app.system.total_memory();
    let used_memory = app.system.used_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        clamp_percent(used_memory as f64 / total_memory as f64 * 100.0)
    };

    // CPU gauge
    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("CPU"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(cpu_usage as u16)
        .label(format!("{:.1}%", cpu_usage));
    f.render_widget(cpu_gauge, chunks[0]);

    // Memory gauge
    let memory_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Memory"))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(memory_percent as u16)
        .label(format!("{:.1}%", memory_percent));
    f.render_widget(memory_gauge, chunks[1]);

    // Queue gauge: processing slots in use out of max_jobs
    let queue_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Queue"))
        .gauge_style(Style::default().fg(Color::Magenta))
        .percent(app.queue_usage() as u16)
        .label(format!(
            "{}/{} processing, {} queued",
            app.count_by_status(JobStatus::Processing),
            app.max_jobs,
            app.count_by_status(JobStatus::Queued)
        ));
    f.render_widget(queue_gauge, chunks[2]);
}

fn status_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "QUEUE",
        JobStatus::Processing => "RUN",
        JobStatus::Completed => "OK",
        JobStatus::Failed => "FAIL",
        JobStatus::Canceled => "CANC",
    }
}

/// Size of the finished video, or "-" while there is none
fn artifact_size(job: &Job) -> String {
    job.artifact
        .as_ref()
        .and_then(|path| std::fs::metadata(path).ok())
        .map(|meta| format_size(meta.len(), DECIMAL))
        .unwrap_or_else(|| "-".to_string())
}

/// Wall time spent processing; running jobs count up to now
fn elapsed(job: &Job) -> String {
    match (job.started_at, job.finished_at) {
        (Some(started), Some(finished)) => format_duration((finished - started).num_seconds()),
        (Some(started), None) if job.status == JobStatus::Processing => {
            format_duration((chrono::Utc::now() - started).num_seconds())
        }
        _ => "-".to_string(),
    }
}

fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// Failure reason, stage while running, otherwise the start of the text
fn detail(job: &Job) -> String {
    match job.status {
        JobStatus::Failed | JobStatus::Canceled => job
            .reason
            .clone()
            .unwrap_or_else(|| job.text.clone()),
        JobStatus::Processing => format!(
            "[{}]{} {}",
            job.stage.as_deref().unwrap_or("starting"),
            if job.cancel_requested { " (canceling)" } else { "" },
            job.text
        ),
        _ => job.text.clone(),
    }
    .replace('\n', " ")
}

fn render_job_table(f: &mut Frame, app: &mut App, area: Rect) {
    // Ensure we have minimum space (header + borders = 3 lines minimum)
    if area.height < 3 {
        let error_msg = Paragraph::new("Not enough space")
            .block(Block::default().borders(Borders::ALL).title("Jobs"));
        f.render_widget(error_msg, area);
        return;
    }

    // borders and header take three lines
    let max_data_rows = (area.height as usize).saturating_sub(3);

    // Use short header names to save space
    let header = Row::new(vec!["ST", "ID", "LANG", "VOICE", "TYPE", "SIZE", "TIME", "TEXT/REASON"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    // Build rows - limit to what fits on screen
    let rows: Vec<Row> = if app.jobs.is_empty() {
        vec![Row::new(vec![
            "-".to_string(),
            "No jobs".to_string(),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
            format!("Dir: {}", app.store_dir.display()),
        ])
        .height(1)]
    } else {
        app.jobs
            .iter()
            .take(max_data_rows)
            .map(|job| {
                // Color by status so failures stand out
                let style = match job.status {
                    JobStatus::Processing => Style::default().fg(Color::Yellow),
                    JobStatus::Failed => Style::default().fg(Color::Red),
                    JobStatus::Completed => Style::default().fg(Color::Green),
                    _ => Style::default(),
                };
                let video_type = match job.video_type {
                    VideoType::Horizontal => "H",
                    VideoType::Vertical => "V",
                };
                // Truncate long fields; the TEXT/REASON column gets the remaining width
                Row::new(vec![
                    status_label(job.status).to_string(),
                    truncate_string(&job.id, 8),
                    job.language.clone(),
                    truncate_string(&job.voice, 12),
                    video_type.to_string(),
                    artifact_size(job),
                    elapsed(job),
                    truncate_string(&detail(job), 80),
                ])
                .style(style)
                .height(1)
            })
            .collect()
    };

    // Column widths - fixed for short fields, percentage for the free text
    let widths = [
        Constraint::Length(5),      // ST
        Constraint::Length(8),      // ID
        Constraint::Length(5),      // LANG
        Constraint::Length(12),     // VOICE
        Constraint::Length(4),      // TYPE
        Constraint::Length(9),      // SIZE
        Constraint::Length(7),      // TIME
        Constraint::Percentage(60), // TEXT/REASON
    ];

    // Show how many jobs fit versus how many exist
    let title = format!("Jobs ({}/{})", rows.len().min(app.jobs.len()), app.jobs.len());

    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    // Truncate directory path if too long
    let dir_display = app.store_dir.display().to_string();
    let status_text = format!(
        "Total: {} | Queued: {} | Processing: {} | Completed: {} | Failed: {} | Canceled: {} | Dir: {} | q=quit r=refresh",
        app.jobs.len(),
        app.count_by_status(JobStatus::Queued),
        app.count_by_status(JobStatus::Processing),
        app.count_by_status(JobStatus::Completed),
        app.count_by_status(JobStatus::Failed),
        app.count_by_status(JobStatus::Canceled),
        truncate_string(&dir_display, 35)
    );

    let paragraph = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .style(Style::default())
        .wrap(ratatui::widgets::Wrap { trim: true });

    f.render_widget(paragraph, area);
}

/// Cut `s` to at most `max_len` chars, ending in "..." when shortened
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
