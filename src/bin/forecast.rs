use casecast::{
    config_path, forecast_path, init_logging, log_app_failed, log_app_finish, log_app_start,
    logging_config_from_env, run_forecast_pipeline, PipelineConfig, EVAL_FORECAST_FILE,
    TEST_FORECAST_FILE,
};

const COMPONENT: &str = "forecast";

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

    if let Err(err) = run_forecast_pipeline(&cfg) {
        log_app_failed(COMPONENT, &err);
        return Err(err.into());
    }

    let eval_path = forecast_path(&cfg, EVAL_FORECAST_FILE);
    let test_path = forecast_path(&cfg, TEST_FORECAST_FILE);
    log_app_finish(COMPONENT, &[eval_path.as_path(), test_path.as_path()]);
    Ok(())
}
