use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "filament-server", about = "Filament realtime gateway server")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/filament.toml")]
    pub config: String,
}
