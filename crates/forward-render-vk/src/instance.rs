// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::ext::debug_utils;
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_void, CStr};
use tracing::{debug, error, info, warn};

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const APP_NAME: &CStr = c"Forward";

/// Loader entry, instance and (optionally) the validation messenger.
/// Dropping it destroys the messenger first, then the instance.
pub struct InstanceContext {
    entry: Entry,
    instance: ash::Instance,
    debug: Option<DebugMessenger>,
}

struct DebugMessenger {
    loader: debug_utils::Instance,
    raw: vk::DebugUtilsMessengerEXT,
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the loader hands us a valid callback struct for the call's duration.
    let p_message = unsafe { (*data).p_message };
    if p_message.is_null() {
        return vk::FALSE;
    }
    let msg = unsafe { CStr::from_ptr(p_message) }.to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[vulkan] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[vulkan] {msg}");
    } else {
        debug!("[vulkan] {msg}");
    }
    vk::FALSE
}

fn messenger_info<'a>() -> vk::DebugUtilsMessengerCreateInfoEXT<'a> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
}

fn has_layer(layers: &[vk::LayerProperties], name: &CStr) -> bool {
    layers
        .iter()
        .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == name)
}

fn has_extension(exts: &[vk::ExtensionProperties], name: &CStr) -> bool {
    exts.iter()
        .any(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) } == name)
}

impl InstanceContext {
    pub fn new(display: RawDisplayHandle, validation: bool) -> Result<Self> {
        let entry = unsafe { Entry::load() }.context("load Vulkan loader")?;

        // Validation is best-effort: a missing layer only costs diagnostics.
        let validation = validation && {
            let layers = unsafe { entry.enumerate_instance_layer_properties() }
                .context("enumerate_instance_layer_properties")?;
            let exts = unsafe { entry.enumerate_instance_extension_properties(None) }
                .context("enumerate_instance_extension_properties")?;
            let ok = has_layer(&layers, VALIDATION_LAYER)
                && has_extension(&exts, debug_utils::NAME);
            if !ok {
                warn!("validation requested but {VALIDATION_LAYER:?} is not available");
            }
            ok
        };

        let mut ext_names = ash_window::enumerate_required_extensions(display)
            .context("enumerate_required_extensions")?
            .to_vec();
        if validation {
            ext_names.push(debug_utils::NAME.as_ptr());
        }
        let layer_names = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .application_version(0)
            .engine_name(APP_NAME)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_0);

        // Chained so instance creation/destruction is covered by the callback too.
        let mut create_dbg = messenger_info();
        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&ext_names)
            .enabled_layer_names(&layer_names);
        if validation {
            create_info = create_info.push_next(&mut create_dbg);
        }

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("create_instance")?;

        let mut ctx = Self {
            entry,
            instance,
            debug: None,
        };

        if validation {
            let loader = debug_utils::Instance::new(&ctx.entry, &ctx.instance);
            let raw = unsafe { loader.create_debug_utils_messenger(&messenger_info(), None) }
                .context("create_debug_utils_messenger")?;
            ctx.debug = Some(DebugMessenger { loader, raw });
        }

        info!("vk: instance ready (validation={})", ctx.debug.is_some());
        Ok(ctx)
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn raw(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn validation_enabled(&self) -> bool {
        self.debug.is_some()
    }
}

impl Drop for InstanceContext {
    fn drop(&mut self) {
        unsafe {
            if let Some(dbg) = self.debug.take() {
                dbg.loader.destroy_debug_utils_messenger(dbg.raw, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
