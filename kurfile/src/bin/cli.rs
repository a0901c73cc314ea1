use kurfile::KurfileError;
use kurfile::run;

fn main() -> Result<(), KurfileError> {
    env_logger::init();
    run(std::env::args().collect())
}
