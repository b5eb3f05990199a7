//! The `rrsync` binary: rsync client and daemon in one executable.

fn main() {
    let code = cli::run(std::env::args_os());
    std::process::exit(code);
}
