use clap::Subcommand;

pub mod evict;
pub mod list;
pub mod reset;
pub mod show;
pub mod size;

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Print the location of the local cache directory.
    Show,

    /// List cached owners, or the documents of one owner.
    List(list::Options),

    /// Print the number and total size of cached documents.
    Size,

    /// Remove documents older than the eviction horizon.
    Evict,

    /// Delete cached documents.
    Reset(reset::Options),
}
