//! usp - Uniflex shader patcher
//!
//! Command-line front end: inspect containers, check that they round-trip and
//! finalise them against a set of texture formats.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use usp_core::Config;
use usp_patcher::block::BlockOwner;
use usp_patcher::{ResultLocation, ShaderGraph, TextureControl, TextureFormat, UspContext};

#[derive(Parser)]
#[command(name = "usp", version, about = "Uniflex shader patcher")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Summarise a container and its graph
    Info { file: PathBuf },

    /// Read a container and write it back
    Roundtrip {
        file: PathBuf,
        /// Where to write the re-encoded container
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Produce hardware-ready code
    Finalise {
        file: PathBuf,
        /// Texture format for a unit, e.g. `0=u8888`
        #[arg(long = "texture", value_parser = parse_texture)]
        textures: Vec<(u16, TextureFormat)>,
        #[arg(long, value_enum, default_value_t = ResultArg::Default)]
        result: ResultArg,
        /// Override the prologue instruction budget
        #[arg(long)]
        budget: Option<usize>,
        /// Print the shader as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ResultArg {
    Default,
    Temp,
    Output,
    Pa,
}

impl From<ResultArg> for ResultLocation {
    fn from(arg: ResultArg) -> Self {
        match arg {
            ResultArg::Default => Self::Default,
            ResultArg::Temp => Self::Temp,
            ResultArg::Output => Self::Output,
            ResultArg::Pa => Self::PrimaryAttr,
        }
    }
}

fn parse_texture(s: &str) -> Result<(u16, TextureFormat), String> {
    let (unit, format) = s
        .split_once('=')
        .ok_or_else(|| format!("expected UNIT=FORMAT, got '{}'", s))?;
    let unit = unit
        .trim()
        .parse::<u16>()
        .map_err(|e| format!("bad texture unit '{}': {}", unit, e))?;
    Ok((unit, format.trim().parse()?))
}

fn read_graph(path: &Path) -> anyhow::Result<(Vec<u8>, ShaderGraph)> {
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let graph = ShaderGraph::from_bytes(&data)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok((data, graph))
}

fn info(path: &Path) -> anyhow::Result<()> {
    let (data, graph) = read_graph(path)?;
    let desc = graph.desc();

    println!("{}: {} bytes, {:?} byte order", path.display(), data.len(), graph.byte_order());
    println!(
        "  {:?} shader, {} temps, {} PAs, {} SAs, {} outputs",
        desc.shader_type, desc.temp_count, desc.pa_count, desc.sa_count, desc.output_count
    );
    println!(
        "  result: {} x{}",
        desc.default_result(),
        desc.result_reg_count
    );
    println!(
        "  {} blocks, {} labels, {} branches, {} samples over {} textures, {} unpacks, {} texture writes, {} result refs",
        graph.blocks().len(),
        graph.labels().len(),
        graph.branches().len(),
        graph.samples().len(),
        graph.texture_groups().len(),
        graph.unpacks().len(),
        graph.texture_writes().len(),
        graph.result_refs().len()
    );

    for (index, block) in graph.blocks().iter().enumerate() {
        let owner = match block.owner {
            BlockOwner::Code { group } => format!("code #{}", group),
            BlockOwner::Label(l) => format!("label {}", graph.label(l).id),
            BlockOwner::Branch(b) => format!("branch -> {}", graph.branches()[b.index()].desc.target),
            BlockOwner::Sample(s) => {
                let desc = &graph.sample(s).desc;
                let kind = if desc.is_dependent() { "dependent" } else { "non-dependent" };
                format!("{} sample {} (texture {})", kind, desc.id(), desc.texture())
            }
            BlockOwner::SampleUnpack(u) => {
                format!("unpack of sample {}", graph.unpacks()[u.index()].desc.sample_id)
            }
            BlockOwner::TextureWrite(t) => {
                format!("texture write {}", graph.texture_writes()[t.index()].desc.id)
            }
            BlockOwner::Prologue => "prologue".to_string(),
        };
        let align = if block.align_to_pair { " [pair]" } else { "" };
        println!("  {:4} {:<36} {:3} insts{}", index, owner, block.len(), align);
    }
    Ok(())
}

fn roundtrip(path: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let (data, graph) = read_graph(path)?;
    let written = graph.to_bytes()?;

    if let Some(out) = output {
        fs::write(out, &written).with_context(|| format!("writing {}", out.display()))?;
        tracing::info!("Wrote {} bytes to {}", written.len(), out.display());
    }

    if data.starts_with(&written) {
        println!("{}: round trip identical ({} bytes)", path.display(), written.len());
        Ok(())
    } else {
        bail!(
            "{}: round trip differs ({} bytes in, {} bytes out)",
            path.display(),
            data.len(),
            written.len()
        )
    }
}

fn finalise(
    config: &Config,
    path: &Path,
    textures: &[(u16, TextureFormat)],
    result: ResultArg,
    budget: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let mut ctx = UspContext::new(&config.patcher);
    for &(unit, format) in textures {
        ctx.set_texture_control(unit, TextureControl::new(format))?;
    }
    ctx.set_result_location(result.into());
    if let Some(budget) = budget {
        ctx.set_prologue_budget(budget);
    }

    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let graph = ctx.create_shader(&data)?;
    let shader = ctx.finalise(&graph)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&shader)?);
        return Ok(());
    }

    println!(
        "{}: {} instructions, entry at {}, result at {} x{}",
        path.display(),
        shader.code.len(),
        shader.entry_offset,
        shader.result,
        shader.result_reg_count
    );
    println!(
        "  {} temps, {} PAs, {} SAs, {} outputs, {} texture state loads",
        shader.temp_count,
        shader.pa_count,
        shader.sa_count,
        shader.output_count,
        shader.tex_state_loads.len()
    );
    for (pc, inst) in shader.code.iter().enumerate() {
        let op = match inst.opcode() {
            Ok(op) => format!("{:?}", op),
            Err(_) => format!("?{:02x}", inst.raw_opcode()),
        };
        println!("  {:4}: {:08x} {:08x}  {}", pc, inst.word1, inst.word0, op);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    usp_core::logging::init(&config.logging);

    match cli.command {
        Command::Info { file } => info(&file),
        Command::Roundtrip { file, output } => roundtrip(&file, output.as_deref()),
        Command::Finalise {
            file,
            textures,
            result,
            budget,
            json,
        } => finalise(&config, &file, &textures, result, budget, json),
    }
}
