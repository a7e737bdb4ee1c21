use casecast::{
    build_and_write_features, config_path, init_logging, log_app_failed, log_app_finish,
    log_app_start, logging_config_from_env, PipelineConfig,
};

const COMPONENT: &str = "build_features";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let path = config_path(std::env::args().skip(1));
    log_app_start(COMPONENT, &logging_cfg, &path);

    let cfg = match PipelineConfig::load(&path) {
        Ok(cfg) => cfg,
        Err(err) => {
            log_app_failed(COMPONENT, &err);
            return Err(err.into());
        }
    };

    if let Err(err) = build_and_write_features(&cfg) {
        log_app_failed(COMPONENT, &err);
        return Err(err.into());
    }

    log_app_finish(COMPONENT, &[cfg.paths.features_csv.as_path()]);
    Ok(())
}
