use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "lambdafy")]
#[command(about = "Deploy any container image as a serverless function", version)]
pub struct Cli {
    /// Render structured output through this template (minijinja syntax,
    /// e.g. '{{ url }}')
    #[arg(short, long, global = true, default_value = "")]
    pub output: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Rewrite a docker image so the runtime adapter runs as its entrypoint
    Make {
        image: String,
    },

    /// Push a prepared image to the managed registry under its content tag
    Push {
        image: String,
        repo: String,
        /// Create the repository if it doesn't exist
        #[arg(short, long)]
        create: bool,
    },

    /// Publish a new version of a function without routing traffic to it
    #[command(alias = "pub")]
    Publish {
        /// Spec file path, or '-' for stdin
        spec_file: String,
        /// Alias to create for the new version
        #[arg(short, long, default_value = "")]
        alias: String,
        /// Force update the alias if it already exists
        #[arg(short = 'A', long)]
        force_update_alias: bool,
        /// Replace placeholders in the spec, e.g. FOO=BAR (repeatable)
        #[arg(short, long = "var")]
        vars: Vec<String>,
    },

    /// Deploy a published version of a function to its public URL
    Deploy {
        function: String,
        version: String,
        /// Prime the function with this many concurrent requests
        #[arg(long, default_value_t = 1)]
        prime: usize,
    },

    /// Remove the deployment and make the function inaccessible
    Undeploy {
        function: String,
        /// Actually undeploy the function
        #[arg(long)]
        yes: bool,
    },

    /// Delete the function entirely
    Delete {
        function: String,
        /// Actually delete the function
        #[arg(short, long)]
        yes: bool,
    },

    /// Create an alias for a function at a specific version
    Alias {
        function: String,
        version: String,
        alias: String,
        /// Force update an existing alias
        #[arg(short, long)]
        force: bool,
    },

    /// Delete an existing function alias
    Unalias {
        function: String,
        alias: String,
    },

    /// List functions
    #[command(alias = "ls")]
    List,

    /// Print out info about a function
    Info {
        function: String,
        /// Version or alias of the function ('latest' for newest)
        #[arg(short, long, default_value = controller::constants::ACTIVE_ALIAS)]
        version: String,
        /// Only print the value of this key
        #[arg(short, long, default_value = "")]
        key: String,
    },

    /// List versions of a function
    #[command(alias = "ver")]
    Versions {
        function: String,
    },

    /// Generate a function spec from a published function
    Spec {
        function: String,
        #[arg(short, long, default_value = controller::constants::ACTIVE_ALIAS)]
        version: String,
    },

    /// Print recent logs for a function
    #[command(alias = "log")]
    Logs {
        function: String,
        #[arg(short, long, default_value = controller::constants::ACTIVE_ALIAS)]
        version: String,
        /// Wait for new logs and print them as they arrive
        #[arg(short, long)]
        tail: bool,
        /// Only print logs from this many minutes ago
        #[arg(short, long, default_value_t = 1)]
        since: u64,
    },

    /// Manage queue event sources
    Sqs {
        #[command(subcommand)]
        command: SqsCommands,
    },

    /// Print an example spec with comments to stdout
    ExampleSpec,

    /// Delete generated roles not referenced by any function
    CleanupRoles,
}

#[derive(Subcommand)]
pub enum SqsCommands {
    /// Add or update a queue event source
    Add {
        function: String,
        arn: String,
        /// Maximum number of messages to process in a single batch
        #[arg(short = 'b', long, default_value_t = 1)]
        batch_size: i32,
    },
    /// Remove the queue event source with the given ARN
    #[command(alias = "rm")]
    Remove {
        function: String,
        arn: String,
    },
    /// Remove all queue event sources
    RemoveAll {
        function: String,
    },
    /// List queue event sources
    List {
        function: String,
    },
}
