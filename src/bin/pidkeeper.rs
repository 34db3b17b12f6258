use std::process::ExitCode;

fn main() -> ExitCode {
    pidkeeper::pm::cli::main()
}
