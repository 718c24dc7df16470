use std::env;
use std::ffi::OsString;
use std::process::{Command, exit};

/// Short alias: forwards every argument to `bunker-transcode`.
fn main() {
    let args: Vec<OsString> = env::args_os().skip(1).collect();

    let program = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("bunker-transcode")))
        .filter(|candidate| candidate.exists())
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("bunker-transcode"));

    match Command::new(&program).args(&args).status() {
        Ok(status) => exit(status.code().unwrap_or(1)),
        Err(err) => {
            eprintln!("Failed to invoke bunker-transcode: {err}");
            exit(1);
        }
    }
}
