use clap::Parser;

fn main() -> anyhow::Result<()> {
    tagplayer_lib::run(tagplayer_lib::cli::Cli::parse())
}
