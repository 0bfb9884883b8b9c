use std::io;

use checkin_emulator::session::{Session, SessionOptions, TranscriptProfile};

fn main() -> io::Result<()> {
    record_profile(TranscriptProfile::Healthy)?;
    record_profile(TranscriptProfile::Update)?;
    record_profile(TranscriptProfile::Flaky)?;
    Ok(())
}

fn record_profile(profile: TranscriptProfile) -> io::Result<()> {
    let mut session = Session::new(SessionOptions::new(profile))?;
    session.boot()?;
    match profile {
        TranscriptProfile::Healthy => record_healthy(&mut session),
        TranscriptProfile::Update => record_update(&mut session),
        TranscriptProfile::Flaky => record_flaky(&mut session),
    }
}

fn run(session: &mut Session, commands: &[&str]) -> io::Result<()> {
    for command in commands {
        let _ = session.handle_command(command)?;
    }
    Ok(())
}

fn record_healthy(session: &mut Session) -> io::Result<()> {
    run(
        session,
        &[
            "status",
            "tick",
            "tick",
            "push 12 21.5",
            "advance 30m",
            "tick",
            "advance 4h",
            "directive SETCMD enable(123),ssid(lab)",
            "tick",
            "time",
            "status",
        ],
    )
}

fn record_update(session: &mut Session) -> io::Result<()> {
    run(
        session,
        &[
            "tick",
            "tick",
            "status",
            "advance 4h",
            "directive REBOOT",
            "tick",
            "status",
        ],
    )
}

fn record_flaky(session: &mut Session) -> io::Result<()> {
    run(
        session,
        &[
            "status",
            "offline",
            "tick",
            "advance 29m",
            "tick",
            "advance 1m",
            "online",
            "tick",
            "tick",
            "publish 14",
            "advance 4h",
            "tick",
            "status",
            "unprovision",
            "restart wipe",
            "status",
        ],
    )
}
