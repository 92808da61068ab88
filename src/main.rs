use directories::ProjectDirs;
use log::{debug, error};

use mentorloop::cli::Cli;
use mentorloop::config::Config;
use mentorloop::logging::setup_logging;
use mentorloop::MentorLoopError;

fn main() {
    if let Err(err) = run() {
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<(), MentorLoopError> {
    let project_dirs = ProjectDirs::from("", "", "mentorloop")
        .ok_or_else(|| MentorLoopError::Error("Could not determine the data directory".into()))?;
    let data_dir = project_dirs.data_local_dir();
    std::fs::create_dir_all(data_dir)?;

    let config = Config::install(Config::load_config(&project_dirs))?;
    std::fs::create_dir_all(config.database.resolve_dir(&project_dirs))?;

    let _logger = setup_logging(&config.logging, &data_dir.join("logs"))?;
    debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

    Cli::handle_command_line(&project_dirs)
}
