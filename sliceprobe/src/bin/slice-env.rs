
use sliceprobe::{ ProbeEnv, PageMap, Translate };

fn main() {
    let online = ProbeEnv::online_cpus();
    let allowed = ProbeEnv::allowed_cpus();

    let isol = match ProbeEnv::sysfs_isolated() {
        Ok(s) => s,
        Err(e) => format!("<read error: {}>", e),
    };
    let smt = match ProbeEnv::sysfs_smt_enabled() {
        Ok(true) => "enabled [!!]".to_string(),
        Ok(false) => "disabled".to_string(),
        Err(e) => format!("<read error: {}>", e),
    };
    let hugepages = match ProbeEnv::procfs_nr_hugepages() {
        Ok(0) => "0 [!!]".to_string(),
        Ok(n) => n.to_string(),
        Err(e) => format!("<read error: {}>", e),
    };

    // Translate something we own to see if PFNs are visible
    let x = Box::new(0u64);
    let vaddr = &*x as *const u64 as usize;
    let pagemap = match PageMap::open_self() {
        Ok(pm) => match pm.translate(vaddr) {
            Ok(_) => "readable".to_string(),
            Err(_) => "no PFNs [!!] (are you root?)".to_string(),
        },
        Err(e) => format!("<open error: {}>", e),
    };

    println!("[*] 'sliceprobe' environment summary:");
    println!("  {:<40}: {}", "online cores", online);
    println!("  {:<40}: {:?}", "allowed cores", allowed);
    println!("  {:<40}: {}", "isolated cores", isol);
    println!("  {:<40}: {}", "simultaneous multithreading (SMT)", smt);
    println!("  {:<40}: {}", "vm.nr_hugepages", hugepages);
    println!("  {:<40}: {}", "/proc/self/pagemap", pagemap);
}
