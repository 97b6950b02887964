use vpp_drv::{run, Config};
use vpp_util::Sink;

fn main() {
    let config = Config::from_args(std::env::args().skip(1));
    let sink = Sink::stderr();
    if let Err(error) = run(&config, &sink) {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}
