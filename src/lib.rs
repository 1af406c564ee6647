pub mod export;
pub mod loaders;
pub mod models;
pub mod module;
pub mod trainers;

// Re-export common types
pub use module::{ModuleInterface, ModuleWrapper};
pub use trainers::{run, DreamTrainer, TrainArgs, TrainError, TrainingConfig};

pub mod logging {
    use env_logger::{Builder, Env};
    use std::io::Write;

    /// Timestamped `env_logger` at `info`, unless `RUST_LOG` says otherwise.
    /// Safe to call more than once.
    pub fn init_logger() {
        let _ = Builder::from_env(Env::default().default_filter_or("info"))
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .try_init();
    }
}
