use sectorfs::{
    BlockDevice, DirEntry, Disk, FileSystem, FileType, FsError, IdeChannel, ImageDisk, OpenFlags, Partition,
    BLOCK_SIZE,
};

use clap::{Parser, Subcommand};
use log::info;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Inspect and edit a sectorfs partition inside a raw disk image.
#[derive(Parser)]
#[command(name = "sectorfs", version)]
struct Cli {
    /// raw disk image on the host
    image: PathBuf,
    /// first sector of the partition
    #[arg(long, default_value_t = 0)]
    start_lba: u32,
    /// sectors in the partition, up to the end of the image by default
    #[arg(long)]
    sec_cnt: Option<u32>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the image and write an empty file system on it
    Mkfs {
        /// size of the new image in sectors
        #[arg(long, default_value_t = 20160)]
        sectors: u32,
    },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print the directory tree under a path
    Tree {
        #[arg(default_value = "/")]
        path: String,
    },
    Mkdir { path: String },
    Rmdir { path: String },
    /// Remove a regular file
    Rm { path: String },
    /// Copy a host file into the file system
    Put { host: PathBuf, path: String },
    /// Print a file
    Cat { path: String },
    Stat { path: String },
    /// Free inodes and blocks
    Df,
}

fn partition(image: &Path, blk_dev: Arc<dyn BlockDevice>, start_lba: u32, sec_cnt: Option<u32>) -> Partition {
    let sectors = blk_dev.sectors() as u32;
    let disk = Disk::new(&image.display().to_string(), IdeChannel::new("ide0"), blk_dev);
    let sec_cnt = sec_cnt.unwrap_or(sectors.saturating_sub(start_lba));
    Partition::new("sda1", disk, start_lba, sec_cnt)
}

fn tree(fs: &FileSystem, path: &str, depth: usize) -> Result<(), FsError> {
    let mut dir = fs.opendir(path)?;
    let entries: Vec<DirEntry> = std::iter::from_fn(|| fs.readdir(&mut dir)).collect();
    fs.closedir(dir);

    for entry in entries {
        let name = entry.name();
        if name == "." || name == ".." {
            continue;
        }
        if entry.f_type == FileType::Directory {
            println!("{}{name}/", "  ".repeat(depth));
            tree(fs, &format!("{}/{name}", path.trim_end_matches('/')), depth + 1)?;
        } else {
            println!("{}{name}", "  ".repeat(depth));
        }
    }
    Ok(())
}

fn put(fs: &FileSystem, host: &Path, path: &str) -> Result<(), Box<dyn Error>> {
    let data = std::fs::read(host)?;
    let fd = fs.open(path, OpenFlags::CREAT | OpenFlags::WRONLY)?;
    let written = fs.write(fd, &data);
    fs.close(fd)?;
    info!("{}: {} bytes written to {path}", host.display(), written?);
    Ok(())
}

fn cat(fs: &FileSystem, path: &str) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let fd = fs.open(path, OpenFlags::RDONLY)?;
    let mut buf = [0u8; BLOCK_SIZE];
    let mut stdout = std::io::stdout().lock();
    loop {
        let n = fs.read(fd, &mut buf)?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n])?;
    }
    fs.close(fd)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Command::Mkfs { sectors } = cli.command {
        let blk_dev = Arc::new(ImageDisk::create(&cli.image, sectors as usize)?);
        let part = partition(&cli.image, blk_dev, cli.start_lba, cli.sec_cnt);
        FileSystem::format(&part)?;
        return Ok(());
    }

    let blk_dev = Arc::new(ImageDisk::open(&cli.image)?);
    let fs = FileSystem::mount(partition(&cli.image, blk_dev, cli.start_lba, cli.sec_cnt))?;
    // paths may be given relative to the root
    let task = fs.task_attach("sectorfs");
    let abs = |path: &str| fs.make_abs_path(&task, path);
    match cli.command {
        Command::Mkfs { .. } => unreachable!(),
        Command::Ls { path } => {
            let mut dir = fs.opendir(&abs(&path))?;
            while let Some(entry) = fs.readdir(&mut dir) {
                let kind = match entry.f_type {
                    FileType::Directory => 'd',
                    _ => '-',
                };
                println!("{kind} {:>5} {}", entry.i_no, entry.name());
            }
            fs.closedir(dir);
        }
        Command::Tree { path } => {
            println!("{path}");
            tree(&fs, &abs(&path), 1)?;
        }
        Command::Mkdir { path } => fs.mkdir(&abs(&path))?,
        Command::Rmdir { path } => fs.rmdir(&abs(&path))?,
        Command::Rm { path } => fs.unlink(&abs(&path))?,
        Command::Put { host, path } => put(&fs, &host, &abs(&path))?,
        Command::Cat { path } => cat(&fs, &abs(&path))?,
        Command::Stat { path } => {
            let stat = fs.stat(&abs(&path))?;
            println!(
                "{path}: inode {} {:?} {} bytes",
                stat.st_ino,
                stat.st_filetype,
                stat.st_size.bytes()
            );
        }
        Command::Df => {
            let sb = fs.super_block();
            println!(
                "inodes {}/{} free, blocks {}/{} free",
                fs.free_inode_count(),
                sb.inode_cnt,
                fs.free_block_count(),
                sb.data_sects()
            );
        }
    }
    fs.task_detach(task);
    Ok(())
}
