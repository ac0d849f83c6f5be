//! Vulkan loading, the optional validation messenger, and physical device
//! queries.
//!
//! Validation is decided at runtime: [`Instance::new`] takes the requested
//! verbosity, checks that both `VK_LAYER_KHRONOS_validation` and
//! `VK_EXT_debug_utils` are present, and routes messages to `tracing`
//! under the `rcompute-debug-messenger` target. A missing layer is not an
//! error; the instance is created without validation.

use std::ffi::{CStr, CString, c_char};

use ash::vk;
use thiserror::Error;

use crate::log::VulkanLogLevel;

const DEBUG_MESSENGER_TARGET: &str = "rcompute-debug-messenger";
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[derive(Debug, Error)]
pub enum InstanceCreationError {
    #[error("Could not load Vulkan: {0}")]
    Loading(ash::LoadingError),
    #[error("Application name contains an interior NUL byte")]
    InvalidAppName,
    #[error("Vulkan error creating instance: {0}")]
    UnknownVulkan(vk::Result),
}

impl From<vk::Result> for InstanceCreationError {
    fn from(value: vk::Result) -> Self {
        InstanceCreationError::UnknownVulkan(value)
    }
}

#[derive(Debug, Error)]
pub enum FetchPhysicalDeviceError {
    #[error("Error fetching physical devices, memory exhaustion")]
    MemoryExhaustion,
    #[error("Error fetching physical devices, Unknown vulkan: {0}")]
    UnknownVulkan(vk::Result),
}

/// What the loader offers for validation output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ValidationSupport {
    layer: bool,
    debug_utils: bool,
}

/// Outcome of matching a validation request against [`ValidationSupport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Validation {
    Off,
    Enabled(VulkanLogLevel),
    Unavailable,
}

impl Validation {
    fn decide(
        requested: Option<VulkanLogLevel>,
        support: ValidationSupport,
    ) -> Self {
        match requested {
            None => Validation::Off,
            Some(level) if support.layer && support.debug_utils => {
                Validation::Enabled(level)
            }
            Some(_) => Validation::Unavailable,
        }
    }
}

fn severity_mask(level: VulkanLogLevel) -> vk::DebugUtilsMessageSeverityFlagsEXT {
    use vk::DebugUtilsMessageSeverityFlagsEXT as S;
    let at_least_error = S::ERROR;
    let at_least_warning = at_least_error | S::WARNING;
    let at_least_info = at_least_warning | S::INFO;
    match level {
        VulkanLogLevel::Error => at_least_error,
        VulkanLogLevel::Warning => at_least_warning,
        VulkanLogLevel::Info => at_least_info,
        VulkanLogLevel::Verbose => at_least_info | S::VERBOSE,
    }
}

/// Short label for a message type. Validation wins over performance, which
/// wins over general, when several bits are set.
fn message_kind(types: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    use vk::DebugUtilsMessageTypeFlagsEXT as T;
    if types.contains(T::VALIDATION) {
        "VALIDATION"
    } else if types.contains(T::PERFORMANCE) {
        "PERFORMANCE"
    } else if types.contains(T::GENERAL) {
        "GENERAL"
    } else {
        "UNKNOWN"
    }
}

unsafe extern "system" fn vulkan_debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    use vk::DebugUtilsMessageSeverityFlagsEXT as S;

    //SAFETY: Vulkan guarantees p_callback_data and its message are valid for
    //the duration of the callback
    let message = unsafe { CStr::from_ptr((*p_callback_data).p_message) }
        .to_string_lossy();
    let kind = message_kind(types);

    if severity.contains(S::ERROR) {
        tracing::error!(target: DEBUG_MESSENGER_TARGET, "[{kind}] {message}");
    } else if severity.contains(S::WARNING) {
        tracing::warn!(target: DEBUG_MESSENGER_TARGET, "[{kind}] {message}");
    } else if severity.contains(S::INFO) {
        tracing::info!(target: DEBUG_MESSENGER_TARGET, "[{kind}] {message}");
    } else {
        tracing::trace!(target: DEBUG_MESSENGER_TARGET, "[{kind}] {message}");
    }

    vk::FALSE
}

fn messenger_create_info(
    level: VulkanLogLevel,
) -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(severity_mask(level))
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback))
}

/// Loaded Vulkan plus the `VkInstance`. Devices hold an `Arc<Instance>`.
pub struct Instance {
    // Must outlive `handle`.
    _entry: ash::Entry,
    handle: ash::Instance,
    debug_messenger:
        Option<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle.handle())
            .field("validation", &self.debug_messenger.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Dropping instance {:?}", self.handle.handle());
        if let Some((messenger, loader)) = self.debug_messenger.take() {
            //SAFETY: the messenger was created from this instance and this is
            //its last use
            unsafe { loader.destroy_debug_utils_messenger(messenger, None) };
        }
        //SAFETY: every device holds an Arc<Instance>, so nothing derived from
        //this instance is still alive
        unsafe { self.handle.destroy_instance(None) };
    }
}

impl Instance {
    /// Load Vulkan and create an instance at the highest API version the
    /// loader reports.
    ///
    /// `validation` of `Some(level)` enables the validation layer when it
    /// is installed; otherwise a warning is logged and creation continues
    /// without it.
    ///
    /// # Safety
    /// This loads the Vulkan library at runtime, which may execute arbitrary
    /// code from it.
    pub unsafe fn new(
        app_name: impl AsRef<str>,
        validation: Option<VulkanLogLevel>,
    ) -> Result<Self, InstanceCreationError> {
        let app_name = CString::new(app_name.as_ref())
            .map_err(|_| InstanceCreationError::InvalidAppName)?;

        //SAFETY: forwarded to the caller. The entry is stored alongside the
        //instance and outlives it.
        let entry = unsafe { ash::Entry::load() }
            .map_err(InstanceCreationError::Loading)?;

        // SAFETY: entry is loaded; this query has no other preconditions.
        let api_version = unsafe { entry.try_enumerate_instance_version() }
            .ok()
            .flatten()
            .unwrap_or(vk::API_VERSION_1_0);

        let support = query_validation_support(&entry)?;
        let decision = Validation::decide(validation, support);
        if decision == Validation::Unavailable {
            tracing::warn!(
                "Validation requested but unavailable ({support:?}); \
                 continuing without it"
            );
        }

        let mut layers: Vec<*const c_char> = Vec::new();
        let mut extensions: Vec<*const c_char> = Vec::new();
        let mut messenger_info = match decision {
            Validation::Enabled(level) => {
                layers.push(VALIDATION_LAYER.as_ptr());
                extensions.push(ash::ext::debug_utils::NAME.as_ptr());
                Some(messenger_create_info(level))
            }
            Validation::Off | Validation::Unavailable => None,
        };

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"rcompute")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions);
        // Chaining the messenger info also reports problems during
        // vkCreateInstance itself.
        if let Some(info) = messenger_info.as_mut() {
            create_info = create_info.push_next(info);
        }

        //SAFETY: create_info and everything it points to is alive here
        let handle = unsafe { entry.create_instance(&create_info, None) }?;

        let debug_messenger = messenger_info.and_then(|mut info| {
            info.p_next = std::ptr::null();
            let loader = ash::ext::debug_utils::Instance::new(&entry, &handle);
            //SAFETY: info is a complete messenger create info for this
            //instance
            match unsafe { loader.create_debug_utils_messenger(&info, None) } {
                Ok(messenger) => Some((messenger, loader)),
                Err(e) => {
                    tracing::error!(
                        "Failed to create debug messenger, continuing \
                         without validation output: {e}"
                    );
                    None
                }
            }
        });

        tracing::info!(
            "Created Vulkan instance (API {}.{}.{}, validation: {})",
            vk::api_version_major(api_version),
            vk::api_version_minor(api_version),
            vk::api_version_patch(api_version),
            debug_messenger.is_some(),
        );

        Ok(Instance {
            _entry: entry,
            handle,
            debug_messenger,
        })
    }

    /// Handles to every physical device. They are only meaningful together
    /// with this instance.
    pub fn fetch_raw_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, FetchPhysicalDeviceError> {
        //SAFETY: The instance handle is valid for the lifetime of self
        unsafe { self.handle.enumerate_physical_devices() }.map_err(|e| match e {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                FetchPhysicalDeviceError::MemoryExhaustion
            }
            e => FetchPhysicalDeviceError::UnknownVulkan(e),
        })
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        //SAFETY: physical_device was derived from this instance
        unsafe { self.handle.get_physical_device_properties(physical_device) }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        //SAFETY: physical_device was derived from this instance
        unsafe {
            self.handle
                .get_physical_device_queue_family_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        // SAFETY: physical_device was derived from this instance.
        unsafe {
            self.handle
                .get_physical_device_memory_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance,
    /// and every handle `create_info` references must be valid for the
    /// duration of the call.
    pub unsafe fn create_ash_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, vk::Result> {
        //SAFETY: guaranteed by the caller
        unsafe {
            self.handle
                .create_device(physical_device, create_info, None)
        }
    }

    /// A debug-utils device loader for object naming, when validation
    /// output is enabled on this instance.
    pub fn create_debug_utils_device_loader(
        &self,
        device: &ash::Device,
    ) -> Option<ash::ext::debug_utils::Device> {
        self.debug_messenger
            .as_ref()
            .map(|_| ash::ext::debug_utils::Device::new(&self.handle, device))
    }
}

fn query_validation_support(
    entry: &ash::Entry,
) -> Result<ValidationSupport, InstanceCreationError> {
    // SAFETY: entry is loaded; None asks for the loader's own extensions.
    let extensions =
        unsafe { entry.enumerate_instance_extension_properties(None) }?;
    // SAFETY: entry is loaded; this query has no other preconditions.
    let layers = unsafe { entry.enumerate_instance_layer_properties() }
        .unwrap_or_default();

    Ok(ValidationSupport {
        layer: layers
            .iter()
            .any(|l| l.layer_name_as_c_str() == Ok(VALIDATION_LAYER)),
        debug_utils: extensions.iter().any(|e| {
            e.extension_name_as_c_str() == Ok(ash::ext::debug_utils::NAME)
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: ValidationSupport = ValidationSupport {
        layer: true,
        debug_utils: true,
    };

    #[test]
    fn severity_mask_includes_everything_above_level() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;

        let warning = severity_mask(VulkanLogLevel::Warning);
        assert!(warning.contains(S::WARNING | S::ERROR));
        assert!(!warning.intersects(S::INFO | S::VERBOSE));

        let verbose = severity_mask(VulkanLogLevel::Verbose);
        assert!(verbose.contains(S::VERBOSE | S::INFO | S::WARNING | S::ERROR));

        assert_eq!(severity_mask(VulkanLogLevel::Error), S::ERROR);
    }

    #[test]
    fn validation_needs_layer_and_debug_utils() {
        assert_eq!(Validation::decide(None, FULL), Validation::Off);
        assert_eq!(
            Validation::decide(Some(VulkanLogLevel::Info), FULL),
            Validation::Enabled(VulkanLogLevel::Info)
        );

        let no_layer = ValidationSupport {
            layer: false,
            ..FULL
        };
        assert_eq!(
            Validation::decide(Some(VulkanLogLevel::Info), no_layer),
            Validation::Unavailable
        );
        assert_eq!(Validation::decide(None, no_layer), Validation::Off);

        let no_ext = ValidationSupport {
            debug_utils: false,
            ..FULL
        };
        assert_eq!(
            Validation::decide(Some(VulkanLogLevel::Error), no_ext),
            Validation::Unavailable
        );
    }

    #[test]
    fn message_kind_prefers_validation() {
        use vk::DebugUtilsMessageTypeFlagsEXT as T;
        assert_eq!(message_kind(T::GENERAL), "GENERAL");
        assert_eq!(message_kind(T::PERFORMANCE), "PERFORMANCE");
        assert_eq!(message_kind(T::VALIDATION | T::PERFORMANCE), "VALIDATION");
        assert_eq!(message_kind(T::empty()), "UNKNOWN");
    }
}
