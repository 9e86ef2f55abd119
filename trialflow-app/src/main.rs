mod app;
pub use app::App;

use env_logger::Env;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => App::load_config(&path)?,
        None => App::builtin_config(),
    };
    let refresh_rate = match args.next() {
        Some(hz) => hz.parse()?,
        None => 60.0,
    };

    let app = App::new(config, refresh_rate)?;
    app.run()?;

    Ok(())
}
