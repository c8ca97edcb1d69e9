use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "arbor",
    about = "Parallel git worktree orchestration with tickets, ports, and PRs",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a tree: a worktree on its own branch with ports and setup.
    New {
        /// Branch name. Rendered from the branch format when omitted and a
        /// ticket is given.
        #[arg(long)]
        branch: Option<String>,

        /// Ticket to bind the tree to (e.g. ENG-123).
        #[arg(long)]
        ticket: Option<String>,

        /// Human title; fetched from the tracker when omitted.
        #[arg(long)]
        title: Option<String>,

        /// Check out an existing branch instead of cutting a new one.
        #[arg(long)]
        existing: bool,
    },

    /// List this repository's trees.
    List,

    /// List your tracker issues, or create one with --create.
    Issues {
        /// Create a new issue with this title instead of listing.
        #[arg(long)]
        create: Option<String>,

        /// Team key for the new issue; defaults to the first configured team.
        #[arg(long)]
        team: Option<String>,

        /// Priority for the new issue: 1 (urgent) to 4 (low).
        #[arg(long)]
        priority: Option<u8>,
    },

    /// Remove a tree's worktree but keep its branch and record.
    Shelve {
        branch: String,

        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },

    /// Recreate the worktree for a shelved tree.
    Resume { branch: String },

    /// Rebase a tree onto the latest base branch and refresh its files.
    Update {
        /// Defaults to the tree this command runs inside.
        branch: Option<String>,

        /// Merge the base branch instead of rebasing onto it.
        #[arg(long)]
        merge: bool,
    },

    /// Push the branch, open a PR, and move the ticket.
    Ship {
        /// Defaults to the tree this command runs inside.
        branch: Option<String>,

        /// Ship even with uncommitted changes.
        #[arg(long)]
        force: bool,

        /// Enable auto-merge on the created PR.
        #[arg(long)]
        auto_merge: bool,

        /// Skip the AI-generated PR description.
        #[arg(long)]
        no_ai: bool,
    },

    /// Merge the tree's PR, then remove worktree, branch, and record.
    Cleanup {
        /// Defaults to the tree this command runs inside.
        branch: Option<String>,

        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },

    /// Remove worktree, branch, and record without merging anything.
    Cancel {
        /// Defaults to the tree this command runs inside.
        branch: Option<String>,

        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },

    /// Drop records whose worktree folders were deleted out-of-band.
    Prune,

    /// Summarize the current tree: commits, base drift, PR state.
    Status,

    /// Watch shared state: reconcile removals from other processes and run
    /// the periodic orphan and merged-PR sweeps.
    Watch,
}
