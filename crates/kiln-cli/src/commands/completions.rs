use super::EXIT_SUCCESS;
use clap::CommandFactory;
use clap_complete::Shell;
use std::io::Write;

pub fn run<C: CommandFactory>(shell: Shell, out: &mut impl Write) -> Result<u8, String> {
    clap_complete::generate(shell, &mut C::command(), "kiln", out);
    out.flush()
        .map_err(|e| format!("failed to write completions: {e}"))?;
    Ok(EXIT_SUCCESS)
}
