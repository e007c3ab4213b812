use pile::config::AppConfig;
use pile::db::Db;

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pile=info,rocket=warn".into()),
        )
        .init();

    let config = AppConfig::from_env();
    tracing::info!(
        database = %config.database_path,
        data_dir = %config.data_dir.display(),
        utc_offset = %config.utc_offset,
        admin_enabled = config.admin_password.is_some(),
        "pile starting"
    );

    let db = Db::open(&config.database_path)?;
    std::fs::create_dir_all(config.uploads_dir())?;

    let _ = pile::build_rocket(db, config).launch().await?;
    Ok(())
}
