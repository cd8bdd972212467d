//! Serde mirrors of the `aws ec2 describe-volumes --output json` payload.

use serde::Deserialize;

use crate::backend::{AttachmentSnapshot, VolumeSnapshot};

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct DescribeVolumesOutput {
    #[serde(default)]
    pub(super) volumes: Vec<Ec2Volume>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct Ec2Volume {
    pub(super) volume_id: String,
    pub(super) state: String,
    #[serde(default)]
    pub(super) availability_zone: String,
    #[serde(default)]
    pub(super) attachments: Vec<Ec2Attachment>,
    #[serde(default)]
    pub(super) tags: Vec<Ec2Tag>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct Ec2Attachment {
    #[serde(default)]
    pub(super) instance_id: String,
    #[serde(default)]
    pub(super) device: String,
    #[serde(default)]
    pub(super) state: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct Ec2Tag {
    pub(super) key: String,
    #[serde(default)]
    pub(super) value: String,
}

impl From<Ec2Volume> for VolumeSnapshot {
    fn from(value: Ec2Volume) -> Self {
        Self {
            id: value.volume_id,
            state: value.state,
            availability_zone: value.availability_zone,
            attachments: value
                .attachments
                .into_iter()
                .map(|attachment| AttachmentSnapshot {
                    instance_id: attachment.instance_id,
                    device: attachment.device,
                    state: attachment.state,
                })
                .collect(),
            tags: value
                .tags
                .into_iter()
                .map(|tag| (tag.key, tag.value))
                .collect(),
        }
    }
}
