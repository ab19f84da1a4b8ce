use anyhow::Result;
use audiodrama::core::config::Config;
use audiodrama::core::state::{is_narrator, CharacterConstraints};
use audiodrama::services::workflow::{Orchestrator, StatusView};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Confirm, CustomType, Select, Text};
use std::time::Duration;

const START: &str = "Produce audio";
const CHANGE_VOICE: &str = "Change a voice";
const QUIT: &str = "Quit";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM and ElevenLabs settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let orchestrator = Orchestrator::from_config(&config)?;
    orchestrator.recover().await?;

    let (prompt, age, constraints) = if config.unattended {
        let request = config.unattended_request()?;
        (request.prompt.clone(), request.age, request.constraints())
    } else {
        ask_for_request()?
    };

    let id = orchestrator.submit(&prompt, age, constraints).await?;
    let status = wait_for(&orchestrator, &id, |s| !matches!(s, StatusView::WaitingForScript { .. })).await?;

    let StatusView::Preview { script, .. } = &status else {
        return report(&status);
    };
    println!("\n{} ({} lines)", script.title, script.dialogue_count());
    println!("{}\n", script.summary);

    loop {
        if let StatusView::Preview { voice_map, .. } = orchestrator.get_status(&id).await? {
            for (name, voice) in &voice_map {
                println!("  {:<20} {}", name, voice);
            }
        }
        if config.unattended {
            break;
        }

        match Select::new("Next step:", vec![START, CHANGE_VOICE, QUIT]).prompt()? {
            START => break,
            CHANGE_VOICE => {
                let names: Vec<String> = script
                    .characters
                    .iter()
                    .filter(|c| !is_narrator(&c.name))
                    .map(|c| c.name.clone())
                    .collect();
                let character = Select::new("Character:", names).prompt()?;
                let pool = orchestrator.voices();
                let voices: Vec<String> = pool
                    .voices
                    .iter()
                    .filter(|v| v.active && v.id != pool.narrator_voice_id)
                    .map(|v| format!("{} ({})", v.id, v.name))
                    .collect();
                let selection = Select::new("Voice:", voices).prompt()?;
                let voice_id = selection.split_whitespace().next().unwrap_or_default();
                if let Err(e) = orchestrator.update_voice_map(&id, &character, voice_id).await {
                    println!("Could not change the voice: {:#}", e);
                }
            }
            _ => {
                println!("Story {} stays in preview.", id);
                return Ok(());
            }
        }
    }

    orchestrator.confirm(&id).await?;
    let status = wait_for(&orchestrator, &id, StatusView::is_terminal).await?;
    report(&status)?;

    if let StatusView::Done { .. } = status {
        if !config.unattended && Confirm::new("Replace a line?").with_default(false).prompt()? {
            let line_id = Text::new("Line id (e.g. s00-l003):").prompt()?;
            let text = Text::new("New text:").prompt()?;
            orchestrator.replace_line(&id, line_id.trim(), &text, None).await?;
            report(&orchestrator.get_status(&id).await?)?;
        }
    }

    Ok(())
}

fn ask_for_request() -> Result<(String, u32, CharacterConstraints)> {
    let prompt = Text::new("What should the story be about?").prompt()?;
    let age = CustomType::<u32>::new("Listener age:")
        .with_default(6)
        .with_error_message("Please enter a whole number")
        .prompt()?;
    let hero = Text::new("Hero name (optional):").prompt()?;
    let constraints = CharacterConstraints {
        hero: Some(hero.trim().to_string()).filter(|h| !h.is_empty()),
        side_characters: Vec::new(),
    };
    Ok((prompt, age, constraints))
}

async fn wait_for(orchestrator: &Orchestrator, id: &str, done: impl Fn(&StatusView) -> bool) -> Result<StatusView> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(120));

    loop {
        let status = orchestrator.get_status(id).await?;
        if done(&status) {
            pb.finish_and_clear();
            return Ok(status);
        }
        if let StatusView::WaitingForScript { progress } | StatusView::GeneratingAudio { progress } = &status {
            pb.set_message(progress.clone().unwrap_or_default());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

fn report(status: &StatusView) -> Result<()> {
    match status {
        StatusView::Done { summary } => {
            println!("\nDone: {}", summary.title);
            if let Some(audio) = &summary.audio_ref {
                println!("Audio: {}", audio);
            }
            if let Some(duration) = summary.duration_seconds {
                println!("Duration: {:.1}s", duration);
            }
            Ok(())
        }
        StatusView::Error { message } => anyhow::bail!("Generation failed: {}", message),
        other => {
            println!("{}", serde_json::to_string_pretty(other)?);
            Ok(())
        }
    }
}
