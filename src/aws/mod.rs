//! EC2 block-storage control plane driven through the AWS CLI.
//!
//! Every call shells out to `aws ec2 <operation> --region <r> ... --output
//! json` and parses the JSON reply. Provider error codes are recovered from
//! the CLI's `An error occurred (<Code>) when calling the <Op> operation`
//! diagnostic so callers can react to specific rejections.

mod types;

use std::ffi::OsString;

use tracing::debug;

use crate::backend::{
    BackendFuture, BlockStorage, CloudError, VOLUME_NOT_FOUND_CODE, VolumeFilter, VolumeSnapshot,
};
use crate::command::{CommandOutput, CommandRunner, ProcessCommandRunner, run_blocking};
use types::DescribeVolumesOutput;

/// Default AWS CLI binary name.
pub const DEFAULT_AWS_BIN: &str = "aws";

const ERROR_MARKER: &str = "An error occurred (";

/// [`BlockStorage`] implementation backed by the `aws` command-line tool.
#[derive(Clone, Debug)]
pub struct AwsCliBlockStorage<R: CommandRunner> {
    aws_bin: String,
    region: String,
    runner: R,
}

impl AwsCliBlockStorage<ProcessCommandRunner> {
    /// Creates a client wired to the real process runner.
    #[must_use]
    pub fn with_process_runner(aws_bin: impl Into<String>, region: impl Into<String>) -> Self {
        Self::new(aws_bin, region, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> AwsCliBlockStorage<R> {
    /// Creates a client issuing requests against `region`.
    #[must_use]
    pub fn new(aws_bin: impl Into<String>, region: impl Into<String>, runner: R) -> Self {
        Self {
            aws_bin: aws_bin.into(),
            region: region.into(),
            runner,
        }
    }

    fn base_args(&self, subcommand: &str) -> Vec<OsString> {
        vec![
            OsString::from("ec2"),
            OsString::from(subcommand),
            OsString::from("--region"),
            OsString::from(&self.region),
        ]
    }

    async fn run_ec2(
        &self,
        operation: &str,
        mut args: Vec<OsString>,
    ) -> Result<String, CloudError> {
        args.push(OsString::from("--output"));
        args.push(OsString::from("json"));
        debug!(operation, region = %self.region, "invoking aws cli");

        let output = run_blocking(&self.runner, &self.aws_bin, &args)
            .await
            .map_err(|err| CloudError::new(operation, err.to_string()))?;
        if output.is_success() {
            return Ok(output.stdout);
        }
        Err(cli_failure(operation, &output))
    }

    async fn describe(
        &self,
        operation: &str,
        args: Vec<OsString>,
    ) -> Result<Vec<VolumeSnapshot>, CloudError> {
        let stdout = self.run_ec2(operation, args).await?;
        let parsed: DescribeVolumesOutput = serde_json::from_str(&stdout).map_err(|err| {
            CloudError::new(operation, format!("unparseable describe-volumes output: {err}"))
        })?;
        Ok(parsed.volumes.into_iter().map(VolumeSnapshot::from).collect())
    }
}

impl<R: CommandRunner> BlockStorage for AwsCliBlockStorage<R> {
    fn describe_volume<'a>(
        &'a self,
        volume_id: &'a str,
    ) -> BackendFuture<'a, VolumeSnapshot, CloudError> {
        Box::pin(async move {
            let mut args = self.base_args("describe-volumes");
            args.push(OsString::from("--volume-ids"));
            args.push(OsString::from(volume_id));

            self.describe("DescribeVolumes", args)
                .await?
                .into_iter()
                .find(|volume| volume.id == volume_id)
                .ok_or_else(|| {
                    CloudError::new(
                        "DescribeVolumes",
                        format!("volume {volume_id} does not exist"),
                    )
                    .with_code(VOLUME_NOT_FOUND_CODE)
                })
        })
    }

    fn find_volumes<'a>(
        &'a self,
        filter: &'a VolumeFilter,
    ) -> BackendFuture<'a, Vec<VolumeSnapshot>, CloudError> {
        Box::pin(async move {
            let mut args = self.base_args("describe-volumes");
            args.push(OsString::from("--filters"));
            args.push(OsString::from(format!("Name=status,Values={}", filter.status)));
            args.push(OsString::from(format!(
                "Name=availability-zone,Values={}",
                filter.availability_zone
            )));
            args.push(OsString::from(format!(
                "Name=tag:{},Values={}",
                filter.tag_key, filter.tag_value
            )));
            self.describe("DescribeVolumes", args).await
        })
    }

    fn attach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
        device: &'a str,
    ) -> BackendFuture<'a, (), CloudError> {
        Box::pin(async move {
            let mut args = self.base_args("attach-volume");
            args.extend([
                OsString::from("--volume-id"),
                OsString::from(volume_id),
                OsString::from("--instance-id"),
                OsString::from(instance_id),
                OsString::from("--device"),
                OsString::from(device),
            ]);
            self.run_ec2("AttachVolume", args).await.map(drop)
        })
    }

    fn detach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
    ) -> BackendFuture<'a, (), CloudError> {
        Box::pin(async move {
            let mut args = self.base_args("detach-volume");
            args.extend([
                OsString::from("--volume-id"),
                OsString::from(volume_id),
                OsString::from("--instance-id"),
                OsString::from(instance_id),
            ]);
            self.run_ec2("DetachVolume", args).await.map(drop)
        })
    }
}

fn cli_failure(operation: &str, output: &CommandOutput) -> CloudError {
    let stderr = output.stderr.trim();
    match parse_error_code(stderr) {
        Some((code, message)) => CloudError::new(operation, message).with_code(code),
        None if stderr.is_empty() => CloudError::new(
            operation,
            format!("aws exited with status {}", output.status_text()),
        ),
        None => CloudError::new(operation, stderr),
    }
}

/// Extracts `(code, message)` from an AWS CLI error diagnostic.
fn parse_error_code(stderr: &str) -> Option<(String, String)> {
    let start = stderr.find(ERROR_MARKER)? + ERROR_MARKER.len();
    let rest = stderr.get(start..)?;
    let end = rest.find(')')?;
    let code = rest.get(..end)?.trim();
    if code.is_empty() {
        return None;
    }
    let message = rest
        .get(end..)
        .and_then(|tail| tail.split_once(": "))
        .map_or_else(|| stderr.to_owned(), |(_, message)| message.trim().to_owned());
    Some((code.to_owned(), message))
}
